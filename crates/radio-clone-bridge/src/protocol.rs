//! Wire protocol for host/engine communication.
//!
//! Envelopes are JSON text. Forward calls (`call` / `call_result`) go from
//! the engine to the host that owns the serial port; reverse calls (`op` /
//! `op_result`) go from the host to the engine. Each direction has its own
//! id space. A failed result carries the error's display text and, when the
//! sender has one, the typed error as a `fault` object tagged by `kind`.

use std::fmt;

use radio_clone_core::{DeviceKey, MemoryRow};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Forward method names served by the host.
pub mod methods {
    pub const SERIAL_OPEN: &str = "serial_open";
    pub const SERIAL_CLOSE: &str = "serial_close";
    pub const SERIAL_WRITE: &str = "serial_write";
    pub const SERIAL_READ: &str = "serial_read";
    pub const SERIAL_PREPARE_CLONE: &str = "serial_prepare_clone";
    pub const SERIAL_RESET_BUFFERS: &str = "serial_reset_buffers";
    pub const CLONE_STATUS: &str = "clone_status";
}

/// Reverse operation names served by the engine.
pub mod ops {
    pub const DOWNLOAD: &str = "download";
    pub const UPLOAD: &str = "upload";
    pub const EXPORT_IMAGE: &str = "export_image";
    pub const IMPORT_IMAGE: &str = "import_image";
    pub const UPLOAD_IMAGE: &str = "upload_image";
    pub const CACHED_ROWS: &str = "cached_rows";
    pub const FAMILIES: &str = "families";
}

/// Which way a request travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Engine to host.
    Forward,
    /// Host to engine.
    Reverse,
}

impl Direction {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }

    const fn request_tag(self) -> &'static str {
        match self {
            Self::Forward => "call",
            Self::Reverse => "op",
        }
    }

    const fn result_tag(self) -> &'static str {
        match self {
            Self::Forward => "call_result",
            Self::Reverse => "op_result",
        }
    }
}

/// One message on the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    CallResult {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fault: Option<Value>,
    },
    Op {
        id: u64,
        op: String,
        #[serde(default)]
        payload: Value,
    },
    OpResult {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fault: Option<Value>,
    },
}

/// A failed request: display text plus the serialized error, if typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub message: String,
    pub typed: Option<Value>,
}

impl Fault {
    /// A fault carrying `err` both as text and as its serialized form.
    #[must_use]
    pub fn typed<E: Serialize + fmt::Display>(err: &E) -> Self {
        Self {
            message: err.to_string(),
            typed: serde_json::to_value(err).ok(),
        }
    }

    /// Rebuild the typed error, if one was sent and it decodes as `E`.
    #[must_use]
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        self.typed
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self {
            message,
            typed: None,
        }
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What an envelope means to a receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Request {
        direction: Direction,
        id: u64,
        name: String,
        payload: Value,
    },
    Response {
        direction: Direction,
        id: u64,
        result: Result<Value, Fault>,
    },
}

impl Envelope {
    #[must_use]
    pub fn request(direction: Direction, id: u64, name: &str, payload: Value) -> Self {
        let name = name.to_string();
        match direction {
            Direction::Forward => Self::Call {
                id,
                method: name,
                payload,
            },
            Direction::Reverse => Self::Op {
                id,
                op: name,
                payload,
            },
        }
    }

    #[must_use]
    pub fn response(direction: Direction, id: u64, result: Result<Value, Fault>) -> Self {
        let (ok, data, error, fault) = match result {
            Ok(data) => (true, Some(data), None, None),
            Err(f) => (false, None, Some(f.message), f.typed),
        };
        match direction {
            Direction::Forward => Self::CallResult {
                id,
                ok,
                data,
                error,
                fault,
            },
            Direction::Reverse => Self::OpResult {
                id,
                ok,
                data,
                error,
                fault,
            },
        }
    }

    #[must_use]
    pub fn decode(self) -> Decoded {
        match self {
            Self::Call {
                id,
                method,
                payload,
            } => Decoded::Request {
                direction: Direction::Forward,
                id,
                name: method,
                payload,
            },
            Self::Op { id, op, payload } => Decoded::Request {
                direction: Direction::Reverse,
                id,
                name: op,
                payload,
            },
            Self::CallResult {
                id,
                ok,
                data,
                error,
                fault,
            } => Decoded::Response {
                direction: Direction::Forward,
                id,
                result: into_result(ok, data, error, fault),
            },
            Self::OpResult {
                id,
                ok,
                data,
                error,
                fault,
            } => Decoded::Response {
                direction: Direction::Reverse,
                id,
                result: into_result(ok, data, error, fault),
            },
        }
    }
}

fn into_result(
    ok: bool,
    data: Option<Value>,
    error: Option<String>,
    fault: Option<Value>,
) -> Result<Value, Fault> {
    if ok {
        Ok(data.unwrap_or(Value::Null))
    } else {
        Err(Fault {
            message: error.unwrap_or_else(|| "remote call failed".to_string()),
            typed: fault,
        })
    }
}

/// The id and kind of an envelope that failed to decode, if recognizable.
#[must_use]
pub fn salvage(text: &str) -> Option<(u64, Direction, bool)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let id = value.get("id")?.as_u64()?;
    let tag = value.get("type")?.as_str()?;
    [Direction::Forward, Direction::Reverse]
        .into_iter()
        .find_map(|direction| {
            if tag == direction.request_tag() {
                Some((id, direction, false))
            } else if tag == direction.result_tag() {
                Some((id, direction, true))
            } else {
                None
            }
        })
}

/// Base64 (standard alphabet) for byte fields.
pub mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    #[must_use]
    pub fn encode(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    /// # Errors
    /// Returns the decode error text.
    pub fn decode(text: &str) -> Result<Vec<u8>, String> {
        BASE64.decode(text).map_err(|e| format!("invalid base64: {e}"))
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub baud_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub count: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReply {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub dtr: bool,
    pub rts: bool,
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub const OK: Self = Self { ok: true };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub key: DeviceKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub key: DeviceKey,
    pub rows: Vec<MemoryRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub key: DeviceKey,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReply {
    pub key: DeviceKey,
    pub size: usize,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_call_serialization() {
        let env = Envelope::request(Direction::Forward, 7, methods::SERIAL_READ, json!({"count": 1}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "call");
        assert_eq!(json["method"], "serial_read");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_result_error_shape() {
        let env = Envelope::response(Direction::Reverse, 3, Err("Unknown device: x".into()));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"op_result\""));
        assert!(!text.contains("\"data\""));

        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed.decode(),
            Decoded::Response {
                direction: Direction::Reverse,
                id: 3,
                result: Err("Unknown device: x".into()),
            }
        );
    }

    #[test]
    fn test_typed_fault_crosses_with_kind() {
        let err = radio_clone_core::CloneError::BlockWriteFailed { address: 0x40 };
        let env = Envelope::response(Direction::Reverse, 5, Err(Fault::typed(&err)));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"], "Failed to write block at 0x0040");
        assert_eq!(json["fault"]["kind"], "block_write_failed");

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        let Decoded::Response {
            result: Err(fault), ..
        } = parsed.decode()
        else {
            panic!("expected a failed response");
        };
        assert!(matches!(
            fault.decode::<radio_clone_core::CloneError>(),
            Some(radio_clone_core::CloneError::BlockWriteFailed { address: 0x40 })
        ));
        assert!(
            Fault::from("text only")
                .decode::<radio_clone_core::CloneError>()
                .is_none()
        );
    }

    #[test]
    fn test_bytes_cross_as_base64() {
        let req = WriteRequest {
            data: vec![0x02, b'P'],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["data"], "AlA=");
        let back: WriteRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);

        assert!(serde_json::from_value::<WriteRequest>(json!({"data": "@@"})).is_err());
    }

    #[test]
    fn test_salvage_malformed() {
        assert_eq!(
            salvage(r#"{"type":"call_result","id":4,"ok":"maybe"}"#),
            Some((4, Direction::Forward, true))
        );
        assert_eq!(
            salvage(r#"{"type":"op","id":9}"#),
            Some((9, Direction::Reverse, false))
        );
        assert_eq!(salvage(r#"{"type":"nope","id":1}"#), None);
        assert_eq!(salvage("not json"), None);
    }
}
