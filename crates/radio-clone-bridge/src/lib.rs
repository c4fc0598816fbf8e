//! Host/engine bridge for clone operations.
//!
//! Provides:
//! - Wire protocol (JSON envelopes, base64 byte fields)
//! - Request correlation over text channels
//! - Host handler serving serial I/O, engine handler serving clone operations

pub mod engine;
pub mod host;
pub mod peer;
pub mod protocol;
pub mod runtime;

pub use engine::{EngineHandler, RemoteTransport};
pub use host::{EngineClient, HostHandler};
pub use peer::{BridgeError, BridgePeer, Handler};
pub use protocol::{Direction, Envelope, Fault};
pub use runtime::BridgedRuntime;
