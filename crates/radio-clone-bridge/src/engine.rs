//! Engine side: a transport that forwards to the host, and the operation
//! handler the host drives.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use radio_clone_core::{
    CloneError, CloneEvent, CloneTransport, ControlLines, ImageStore, ReadOutcome, SessionInfo,
    TransportError,
};
use radio_clone_session::CloneManager;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    peer::{BridgeError, BridgePeer, Handler, decode_payload, encode_reply},
    protocol::{
        Ack, DeviceRequest, Fault, ImagePayload, ImageReply, OpenRequest, PrepareRequest, ReadReply,
        ReadRequest, UploadRequest, WriteReply, WriteRequest, methods, ops,
    },
};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Rebuild the host's transport error from the fault it sent.
fn transport_error(fault: Fault) -> TransportError {
    match fault.decode::<CloneError>() {
        Some(CloneError::TransportUnavailable(msg)) => TransportError::Unavailable(msg),
        Some(CloneError::AlreadyConnected) => TransportError::AlreadyOpen,
        Some(CloneError::NotConnected) => TransportError::NotConnected,
        _ => TransportError::Bridge(fault.message),
    }
}

/// [`CloneTransport`] whose every call crosses the bridge to the host.
pub struct RemoteTransport {
    peer: Arc<BridgePeer>,
}

impl RemoteTransport {
    #[must_use]
    pub const fn new(peer: Arc<BridgePeer>) -> Self {
        Self { peer }
    }

    async fn call<P, R>(&self, method: &str, payload: &P) -> Result<R, TransportError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.peer
            .call(method, payload)
            .await
            .map_err(|e| match e {
                BridgeError::Remote(fault) => transport_error(fault),
                other => TransportError::Bridge(other.to_string()),
            })
    }
}

#[async_trait]
impl CloneTransport for RemoteTransport {
    async fn open(&self, baud_rate: u32) -> Result<SessionInfo, TransportError> {
        self.call(methods::SERIAL_OPEN, &OpenRequest { baud_rate })
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _: Ack = self.call(methods::SERIAL_CLOSE, &Value::Null).await?;
        Ok(())
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let reply: WriteReply = self
            .call(
                methods::SERIAL_WRITE,
                &WriteRequest {
                    data: bytes.to_vec(),
                },
            )
            .await?;
        Ok(reply.written)
    }

    async fn read_bytes(&self, count: usize, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        let reply: ReadReply = self
            .call(
                methods::SERIAL_READ,
                &ReadRequest {
                    count,
                    timeout_ms: millis(timeout),
                },
            )
            .await?;
        Ok(ReadOutcome {
            bytes: reply.data,
            timed_out: reply.timed_out,
        })
    }

    async fn prepare_clone(&self, lines: ControlLines, settle: Duration) -> Result<(), TransportError> {
        let _: Ack = self
            .call(
                methods::SERIAL_PREPARE_CLONE,
                &PrepareRequest {
                    dtr: lines.dtr,
                    rts: lines.rts,
                    settle_ms: millis(settle),
                },
            )
            .await?;
        Ok(())
    }

    async fn reset_input(&self) -> Result<(), TransportError> {
        let _: Ack = self
            .call(methods::SERIAL_RESET_BUFFERS, &Value::Null)
            .await?;
        Ok(())
    }
}

/// Serves reverse operations against a [`CloneManager`].
pub struct EngineHandler<S: ImageStore> {
    manager: Arc<CloneManager<S>>,
}

impl<S: ImageStore> EngineHandler<S> {
    #[must_use]
    pub const fn new(manager: Arc<CloneManager<S>>) -> Self {
        Self { manager }
    }

    async fn dispatch(&self, op: &str, payload: Value) -> Result<Value, Fault> {
        let fault = |e: CloneError| Fault::typed(&e);
        match op {
            ops::DOWNLOAD => {
                let req: DeviceRequest = decode_payload(payload)?;
                encode_reply(&self.manager.download(&req.key).await.map_err(fault)?)
            }
            ops::UPLOAD => {
                let req: UploadRequest = decode_payload(payload)?;
                encode_reply(&self.manager.upload(&req.key, &req.rows).await.map_err(fault)?)
            }
            ops::UPLOAD_IMAGE => {
                let req: ImagePayload = decode_payload(payload)?;
                encode_reply(
                    &self
                        .manager
                        .upload_image(&req.key, req.data)
                        .await
                        .map_err(fault)?,
                )
            }
            ops::CACHED_ROWS => {
                let req: DeviceRequest = decode_payload(payload)?;
                encode_reply(&self.manager.cached_rows(&req.key).await.map_err(fault)?)
            }
            ops::EXPORT_IMAGE => {
                let req: DeviceRequest = decode_payload(payload)?;
                let image = self.manager.export_image(&req.key).await.map_err(fault)?;
                encode_reply(&ImageReply {
                    key: image.key().clone(),
                    size: image.size(),
                    data: image.into_bytes(),
                })
            }
            ops::IMPORT_IMAGE => {
                let req: ImagePayload = decode_payload(payload)?;
                let image = self
                    .manager
                    .import_image(&req.key, req.data)
                    .await
                    .map_err(fault)?;
                encode_reply(&ImageReply {
                    key: image.key().clone(),
                    size: image.size(),
                    data: Vec::new(),
                })
            }
            ops::FAMILIES => encode_reply(&self.manager.families()),
            other => Err(format!("unknown op: {other}").into()),
        }
    }
}

#[async_trait]
impl<S: ImageStore + 'static> Handler for EngineHandler<S> {
    async fn handle(&self, name: &str, payload: Value) -> Result<Value, Fault> {
        tracing::debug!(op = %name, "Engine op");
        self.dispatch(name, payload).await
    }
}

/// Relay the manager's progress events to the host as `clone_status` calls,
/// in order, until the store or the bridge goes away.
pub fn forward_progress(
    peer: Arc<BridgePeer>,
    mut events: broadcast::Receiver<CloneEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let Err(e) = peer.call::<_, Ack>(methods::CLONE_STATUS, &event).await {
                tracing::debug!("Stopping progress relay: {e}");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use radio_clone_core::{CloneContext, CloneTiming};
    use radio_clone_engine::FamilyRegistry;
    use radio_clone_serial::{SimulatedRadio, TransportOwner};
    use radio_clone_session::MemoryImageStore;
    use serde_json::json;

    use super::*;

    fn handler() -> EngineHandler<MemoryImageStore> {
        let radio = SimulatedRadio::new(b"PROGRAM", b"P3107\x01\x00\x00", vec![0xFF; 128]);
        let manager = CloneManager::new(
            MemoryImageStore::new(),
            Arc::new(TransportOwner::new(radio)),
            Arc::new(FamilyRegistry::builtin()),
            CloneContext::new(CloneTiming::fast()),
        );
        EngineHandler::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn test_unknown_op() {
        assert_eq!(
            handler().handle("format", Value::Null).await.unwrap_err(),
            Fault::from("unknown op: format")
        );
    }

    #[tokio::test]
    async fn test_errors_cross_with_text_and_kind() {
        let err = handler()
            .handle(
                ops::DOWNLOAD,
                json!({"key": "nope.Nope"}),
            )
            .await
            .unwrap_err();
        assert!(err.message.starts_with("Unknown device"), "{err}");
        assert_eq!(err.typed.as_ref().unwrap()["kind"], "unknown_device");

        let err = handler()
            .handle(
                ops::EXPORT_IMAGE,
                json!({"key": "p3107.CompactHandheld"}),
            )
            .await
            .unwrap_err();
        assert!(err.message.starts_with("No cached radio image"), "{err}");
        assert!(matches!(err.decode::<CloneError>(), Some(CloneError::NoCachedImage(_))));
    }

    #[tokio::test]
    async fn test_families_op() {
        let value = handler().handle(ops::FAMILIES, Value::Null).await.unwrap();
        assert_eq!(value[0]["baud_rate"], 9600);
        assert_eq!(value[0]["channels"], 6);
    }

    #[test]
    fn test_transport_error_rebuilt_from_fault() {
        let fault = Fault::typed(&CloneError::NotConnected);
        assert!(matches!(transport_error(fault), TransportError::NotConnected));

        let fault = Fault::typed(&CloneError::TransportUnavailable("unplugged".into()));
        assert!(matches!(transport_error(fault), TransportError::Unavailable(m) if m == "unplugged"));

        let fault = Fault::from("unknown method: serial_flush");
        assert!(matches!(
            transport_error(fault),
            TransportError::Bridge(m) if m == "unknown method: serial_flush"
        ));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(250)), 250);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
