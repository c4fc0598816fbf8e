//! Clone protocol engine.
//!
//! Provides:
//! - `DeviceFamily` / `FamilyRegistry` - per-model protocol profiles
//! - `CloneEngine` - the enter / identify / transfer / exit state machine
//! - Channel record encoding for the memory map

pub mod family;
pub mod layout;
pub mod protocol;

pub use family::{DeviceFamily, FamilyError, FamilyRegistry};
pub use layout::{ChannelLayout, LayoutError, RECORD_SIZE};
pub use protocol::{CloneEngine, EngineState, ProgrammingMode};
