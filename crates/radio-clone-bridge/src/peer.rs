//! Request/response correlation over an envelope channel.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Decoded, Direction, Envelope, Fault, salvage};

/// Bridge error.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge closed")]
    Closed,
    #[error("{0}")]
    Remote(Fault),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serves requests arriving from the other side.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `name` with `payload`. The fault is sent back verbatim.
    async fn handle(&self, name: &str, payload: Value) -> Result<Value, Fault>;
}

type Pending = oneshot::Sender<Result<Value, Fault>>;

/// One end of the bridge.
///
/// Issues requests in its `outgoing` direction and answers requests in the
/// opposite one.
pub struct BridgePeer {
    outgoing: Direction,
    tx: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    closed: AtomicBool,
}

impl BridgePeer {
    #[must_use]
    pub fn new(outgoing: Direction, tx: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            outgoing,
            tx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn outgoing(&self) -> Direction {
        self.outgoing
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map_or(0, |p| p.len())
    }

    /// Issue a request and wait for its response.
    ///
    /// # Errors
    /// `Closed` if the bridge is torn down first, `Remote` with the other
    /// side's error text, `Json` if either payload fails to convert.
    pub async fn call<P, R>(&self, name: &str, payload: &P) -> Result<R, BridgeError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().map_err(|_| BridgeError::Closed)?;
            if self.closed.load(Ordering::Acquire) {
                return Err(BridgeError::Closed);
            }
            pending.insert(id, tx);
        }

        let text = serde_json::to_string(&Envelope::request(self.outgoing, id, name, payload))?;
        if self.tx.send(text).is_err() {
            self.forget(id);
            return Err(BridgeError::Closed);
        }
        tracing::trace!(id, name, "Bridge request sent");

        let value = rx
            .await
            .map_err(|_| BridgeError::Closed)?
            .map_err(BridgeError::Remote)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Complete the pending call `id`. Returns false for an unknown or
    /// already resolved id.
    pub fn resolve(&self, id: u64, result: Result<Value, Fault>) -> bool {
        let sender = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => {
                tracing::debug!(id, "Ignoring response with no pending call");
                false
            }
        }
    }

    /// Reject every pending call and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, Pending)> = match self.pending.lock() {
            Ok(mut pending) => {
                self.closed.store(true, Ordering::Release);
                pending.drain().collect()
            }
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Rejecting pending bridge calls");
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(Fault::from(reason)));
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    fn reply(&self, id: u64, result: Result<Value, Fault>) {
        let envelope = Envelope::response(self.outgoing.opposite(), id, result);
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if self.tx.send(text).is_err() {
                    tracing::debug!(id, "Bridge closed before reply");
                }
            }
            Err(e) => tracing::error!("Failed to encode bridge reply: {e}"),
        }
    }
}

/// Route inbound envelopes until the channel closes, then reject anything
/// still pending.
pub async fn serve(
    peer: Arc<BridgePeer>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    handler: Arc<dyn Handler>,
) {
    let incoming = peer.outgoing.opposite();
    while let Some(text) = inbound.recv().await {
        let decoded = match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => envelope.decode(),
            Err(e) => {
                handle_malformed(&peer, &text, &e);
                continue;
            }
        };

        match decoded {
            Decoded::Response { direction, id, result } if direction == peer.outgoing => {
                peer.resolve(id, result);
            }
            Decoded::Request {
                direction,
                id,
                name,
                payload,
            } if direction == incoming => {
                let peer = Arc::clone(&peer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(handler.handle(&name, payload))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            tracing::error!(name = %name, "Bridge handler panicked");
                            Err(Fault::from(format!("handler for {name} panicked")))
                        });
                    peer.reply(id, result);
                });
            }
            other => tracing::debug!(?other, "Ignoring envelope for the other side"),
        }
    }

    tracing::debug!("Bridge inbound closed");
    peer.fail_all("bridge closed");
}

fn handle_malformed(peer: &BridgePeer, text: &str, err: &serde_json::Error) {
    match salvage(text) {
        Some((id, direction, true)) if direction == peer.outgoing => {
            peer.resolve(id, Err(Fault::from(format!("malformed response: {err}"))));
        }
        Some((id, direction, false)) if direction != peer.outgoing => {
            peer.reply(id, Err(Fault::from(format!("malformed request: {err}"))));
        }
        _ => tracing::warn!("Dropping malformed bridge message: {err}"),
    }
}

/// Decode a request payload.
///
/// # Errors
/// Returns the decode error text.
pub fn decode_payload<P: DeserializeOwned>(payload: Value) -> Result<P, Fault> {
    serde_json::from_value(payload).map_err(|e| Fault::from(format!("invalid payload: {e}")))
}

/// Encode a reply payload.
///
/// # Errors
/// Returns the encode error text.
pub fn encode_reply<R: Serialize>(reply: &R) -> Result<Value, Fault> {
    serde_json::to_value(reply).map_err(|e| Fault::from(format!("failed to encode reply: {e}")))
}
