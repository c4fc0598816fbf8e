//! Core abstractions for radio clone-mode transfers.
//!
//! This crate provides the fundamental building blocks:
//! - `DeviceKey`, `CloneImage`, `MemoryRow` - the shared data model
//! - `CloneError` - the error taxonomy every layer reports with
//! - `CloneTransport` / `ImageStore` - capability traits injected into the engine and cache
//! - `ProgressStore` - broadcast + history of progress events

pub mod context;
pub mod error;
pub mod progress;
pub mod traits;
pub mod types;

pub use context::{CloneContext, CloneTiming};
pub use error::{CloneError, ErrorClass, TransportError};
pub use progress::{CloneEvent, ProgressStore};
pub use traits::{CloneTransport, ImageStore, StorageError};
pub use types::{
    BlockSpan, CloneImage, ControlLines, CrossMode, DeviceKey, DtcsPolarity, Duplex,
    MemoryRow, Mode, PowerLevel, ReadOutcome, SessionInfo, ToneMode,
};

/// Byte acknowledging the previous unit.
pub const ACK: u8 = 0x06;

/// Byte rejecting the previous unit.
pub const NAK: u8 = 0x15;
