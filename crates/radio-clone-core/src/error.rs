//! Error taxonomy shared by the engine, the cache and the bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial transport unavailable: {0}")]
    Unavailable(String),
    #[error("Serial session already open")]
    AlreadyOpen,
    #[error("Serial session not open")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bridge error: {0}")]
    Bridge(String),
}

/// Errors surfaced by clone operations.
///
/// The `Display` text is what crosses the bridge, so it stays stable. The
/// serialized form is tagged by `kind` so the receiving side can rebuild
/// the same variant.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloneError {
    #[error("Serial transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Serial session already open")]
    AlreadyConnected,
    #[error("Serial session not open")]
    NotConnected,
    #[error("Radio refused to enter programming mode: {0}")]
    ProtocolRefused(String),
    #[error("Radio returned unknown identification {}", hex(.ident))]
    IdentMismatch { ident: Vec<u8> },
    #[error("Failed to read block at {address:#06x}")]
    BlockReadFailed { address: u16 },
    #[error("Failed to write block at {address:#06x}")]
    BlockWriteFailed { address: u16 },
    #[error("No cached radio image for {0}; download from the radio first")]
    NoCachedImage(String),
    #[error("Timed out waiting for the radio ({} bytes received)", .partial.len())]
    Timeout { partial: Vec<u8> },
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Invalid channel row: {0}")]
    InvalidRow(String),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Bridge(String),
}

/// How a user should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reconnect or power-cycle the radio and run the whole operation again.
    Retryable,
    /// The selected device profile does not match the radio.
    WrongDevice,
    Fatal,
}

impl CloneError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. }
            | Self::ProtocolRefused(_)
            | Self::BlockReadFailed { .. }
            | Self::BlockWriteFailed { .. }
            | Self::TransportUnavailable(_)
            | Self::NotConnected => ErrorClass::Retryable,
            Self::IdentMismatch { .. } => ErrorClass::WrongDevice,
            _ => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retryable)
    }

    /// Short suggestion for the operator.
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self.class() {
            ErrorClass::Retryable => "check the cable and radio power, reconnect, then retry",
            ErrorClass::WrongDevice => "the radio does not match the selected model; do not retry blindly",
            ErrorClass::Fatal => "fix the request before trying again",
        }
    }
}

impl From<TransportError> for CloneError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(msg) => Self::TransportUnavailable(msg),
            TransportError::AlreadyOpen => Self::AlreadyConnected,
            TransportError::NotConnected => Self::NotConnected,
            TransportError::Io(e) => Self::TransportUnavailable(e.to_string()),
            TransportError::Bridge(msg) => Self::Bridge(msg),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(CloneError::Timeout { partial: vec![] }.is_retryable());
        assert!(CloneError::ProtocolRefused("no ack".into()).is_retryable());
        assert_eq!(
            CloneError::IdentMismatch { ident: b"XXXXXXXX".to_vec() }.class(),
            ErrorClass::WrongDevice
        );
        assert_eq!(
            CloneError::NoCachedImage("p3107.CompactHandheld".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_messages_are_stable() {
        assert_eq!(
            CloneError::BlockWriteFailed { address: 0x20 }.to_string(),
            "Failed to write block at 0x0020"
        );
        assert_eq!(
            CloneError::IdentMismatch { ident: vec![0x50, 0x33] }.to_string(),
            "Radio returned unknown identification 50 33"
        );
    }

    #[test]
    fn test_serialized_kind_rebuilds_variant() {
        let json = serde_json::to_value(CloneError::BlockReadFailed { address: 0x38 }).unwrap();
        assert_eq!(json["kind"], "block_read_failed");
        let back: CloneError = serde_json::from_value(json).unwrap();
        assert!(matches!(back, CloneError::BlockReadFailed { address: 0x38 }));
        assert!(back.is_retryable());

        let json = serde_json::to_value(CloneError::NotConnected).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "not_connected"}));

        let back: CloneError = serde_json::from_value(serde_json::json!({
            "kind": "ident_mismatch",
            "detail": {"ident": [85, 86, 53, 82]},
        }))
        .unwrap();
        assert_eq!(back.class(), ErrorClass::WrongDevice);
    }

    #[test]
    fn test_transport_error_conversion() {
        assert!(matches!(
            CloneError::from(TransportError::AlreadyOpen),
            CloneError::AlreadyConnected
        ));
        assert!(matches!(
            CloneError::from(TransportError::NotConnected),
            CloneError::NotConnected
        ));
    }
}
