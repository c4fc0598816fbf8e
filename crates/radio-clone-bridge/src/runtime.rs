//! In-process wiring of a host and an engine over the bridge.

use std::sync::Arc;

use radio_clone_core::{CloneContext, CloneTransport, ProgressStore};
use radio_clone_engine::FamilyRegistry;
use radio_clone_session::{CloneManager, MemoryImageStore};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    engine::{EngineHandler, RemoteTransport, forward_progress},
    host::{EngineClient, HostHandler},
    peer::{BridgePeer, serve},
    protocol::Direction,
};

/// A host and an engine joined by two JSON text channels.
///
/// The host owns `transport`; the engine reaches it only through forward
/// calls. Engine progress lands in the host's `ProgressStore`.
pub struct BridgedRuntime {
    client: EngineClient,
    engine_peer: Arc<BridgePeer>,
    host_peer: Arc<BridgePeer>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgedRuntime {
    /// Spawn both sides on the current runtime.
    #[must_use]
    pub fn start(
        transport: Arc<dyn CloneTransport>,
        registry: Arc<FamilyRegistry>,
        context: CloneContext,
        host_progress: Arc<ProgressStore>,
    ) -> Self {
        let (to_host, host_inbound) = mpsc::unbounded_channel();
        let (to_engine, engine_inbound) = mpsc::unbounded_channel();

        let engine_peer = BridgePeer::new(Direction::Forward, to_host);
        let host_peer = BridgePeer::new(Direction::Reverse, to_engine);

        let manager = Arc::new(CloneManager::new(
            MemoryImageStore::new(),
            Arc::new(RemoteTransport::new(Arc::clone(&engine_peer))),
            registry,
            context,
        ));
        let events = manager.progress().get_receiver();

        let tasks = vec![
            tokio::spawn(serve(
                Arc::clone(&host_peer),
                host_inbound,
                Arc::new(HostHandler::new(transport, host_progress)),
            )),
            tokio::spawn(serve(
                Arc::clone(&engine_peer),
                engine_inbound,
                Arc::new(EngineHandler::new(manager)),
            )),
            forward_progress(Arc::clone(&engine_peer), events),
        ];
        tracing::debug!("Bridge runtime started");

        Self {
            client: EngineClient::new(Arc::clone(&host_peer)),
            engine_peer,
            host_peer,
            tasks,
        }
    }

    /// Handle for issuing operations to the engine.
    #[must_use]
    pub fn client(&self) -> EngineClient {
        self.client.clone()
    }

    /// Stop both sides. Calls still in flight fail with "bridge closed".
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.host_peer.fail_all("bridge closed");
        self.engine_peer.fail_all("bridge closed");
        tracing::debug!("Bridge runtime stopped");
    }
}

impl Drop for BridgedRuntime {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.shutdown();
        }
    }
}
