//! Host side: serves serial I/O to the engine and drives reverse operations.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use radio_clone_core::{
    CloneError, CloneEvent, CloneImage, CloneTransport, ControlLines, DeviceKey, MemoryRow,
    ProgressStore, TransportError,
};
use radio_clone_session::{DownloadSummary, FamilySummary, UploadSummary};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    peer::{BridgeError, BridgePeer, Handler, decode_payload, encode_reply},
    protocol::{
        Ack, DeviceRequest, ImagePayload, ImageReply, OpenRequest, PrepareRequest, ReadReply,
        Fault, ReadRequest, UploadRequest, WriteReply, WriteRequest, methods, ops,
    },
};

/// A transport error crosses as the clone error it becomes, keeping its own
/// text.
fn transport_fault(err: TransportError) -> Fault {
    let message = err.to_string();
    Fault {
        message,
        ..Fault::typed(&CloneError::from(err))
    }
}

/// Serves forward calls against the transport the host owns.
pub struct HostHandler {
    transport: Arc<dyn CloneTransport>,
    progress: Arc<ProgressStore>,
}

impl HostHandler {
    #[must_use]
    pub fn new(transport: Arc<dyn CloneTransport>, progress: Arc<ProgressStore>) -> Self {
        Self {
            transport,
            progress,
        }
    }

    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value, Fault> {
        match method {
            methods::SERIAL_OPEN => {
                let req: OpenRequest = decode_payload(payload)?;
                let info = self
                    .transport
                    .open(req.baud_rate)
                    .await
                    .map_err(transport_fault)?;
                encode_reply(&info)
            }
            methods::SERIAL_CLOSE => {
                self.transport.close().await.map_err(transport_fault)?;
                encode_reply(&Ack::OK)
            }
            methods::SERIAL_WRITE => {
                let req: WriteRequest = decode_payload(payload)?;
                let written = self
                    .transport
                    .write_bytes(&req.data)
                    .await
                    .map_err(transport_fault)?;
                encode_reply(&WriteReply { written })
            }
            methods::SERIAL_READ => {
                let req: ReadRequest = decode_payload(payload)?;
                let outcome = self
                    .transport
                    .read_bytes(req.count, Duration::from_millis(req.timeout_ms))
                    .await
                    .map_err(transport_fault)?;
                encode_reply(&ReadReply {
                    data: outcome.bytes,
                    timed_out: outcome.timed_out,
                })
            }
            methods::SERIAL_PREPARE_CLONE => {
                let req: PrepareRequest = decode_payload(payload)?;
                let lines = ControlLines {
                    dtr: req.dtr,
                    rts: req.rts,
                };
                self.transport
                    .prepare_clone(lines, Duration::from_millis(req.settle_ms))
                    .await
                    .map_err(transport_fault)?;
                encode_reply(&Ack::OK)
            }
            methods::SERIAL_RESET_BUFFERS => {
                self.transport
                    .reset_input()
                    .await
                    .map_err(transport_fault)?;
                encode_reply(&Ack::OK)
            }
            methods::CLONE_STATUS => {
                let event: CloneEvent = decode_payload(payload)?;
                tracing::debug!(%event, "Engine status");
                self.progress.push(event);
                encode_reply(&Ack::OK)
            }
            other => Err(format!("unknown method: {other}").into()),
        }
    }
}

#[async_trait]
impl Handler for HostHandler {
    async fn handle(&self, name: &str, payload: Value) -> Result<Value, Fault> {
        self.dispatch(name, payload).await
    }
}

/// Typed reverse operations issued by the host.
#[derive(Clone)]
pub struct EngineClient {
    peer: Arc<BridgePeer>,
}

impl EngineClient {
    #[must_use]
    pub const fn new(peer: Arc<BridgePeer>) -> Self {
        Self { peer }
    }

    async fn op<P, R>(&self, op: &str, payload: &P) -> Result<R, CloneError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.peer.call(op, payload).await.map_err(|e| match e {
            BridgeError::Remote(fault) => fault
                .decode()
                .unwrap_or_else(|| CloneError::Bridge(fault.message)),
            other => CloneError::Bridge(other.to_string()),
        })
    }

    /// Download the radio's memory into the engine's cache.
    ///
    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn download(&self, key: &DeviceKey) -> Result<DownloadSummary, CloneError> {
        self.op(ops::DOWNLOAD, &DeviceRequest { key: key.clone() })
            .await
    }

    /// Replace the cached channel table with `rows` and write it.
    ///
    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn upload(&self, key: &DeviceKey, rows: Vec<MemoryRow>) -> Result<UploadSummary, CloneError> {
        self.op(
            ops::UPLOAD,
            &UploadRequest {
                key: key.clone(),
                rows,
            },
        )
        .await
    }

    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn cached_rows(&self, key: &DeviceKey) -> Result<Vec<MemoryRow>, CloneError> {
        self.op(ops::CACHED_ROWS, &DeviceRequest { key: key.clone() })
            .await
    }

    /// The cached image.
    ///
    /// # Errors
    /// The engine's error, or `InvalidImage` if the reply is inconsistent.
    pub async fn export_image(&self, key: &DeviceKey) -> Result<CloneImage, CloneError> {
        let reply: ImageReply = self
            .op(ops::EXPORT_IMAGE, &DeviceRequest { key: key.clone() })
            .await?;
        CloneImage::new(reply.key, reply.data, reply.size)
    }

    /// Replace the engine's cache entry.
    ///
    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn import_image(&self, key: &DeviceKey, data: Vec<u8>) -> Result<usize, CloneError> {
        let reply: ImageReply = self
            .op(
                ops::IMPORT_IMAGE,
                &ImagePayload {
                    key: key.clone(),
                    data,
                },
            )
            .await?;
        Ok(reply.size)
    }

    /// Write a complete image.
    ///
    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn upload_image(&self, key: &DeviceKey, data: Vec<u8>) -> Result<UploadSummary, CloneError> {
        self.op(
            ops::UPLOAD_IMAGE,
            &ImagePayload {
                key: key.clone(),
                data,
            },
        )
        .await
    }

    /// # Errors
    /// The engine's error, rebuilt from its kind.
    pub async fn families(&self) -> Result<Vec<FamilySummary>, CloneError> {
        self.op(ops::FAMILIES, &Value::Null).await
    }
}
