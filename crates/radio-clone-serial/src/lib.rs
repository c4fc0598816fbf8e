//! Serial transport ownership for clone transfers.
//!
//! Provides:
//! - `TransportOwner` - Exclusive session owner implementing `CloneTransport`
//! - `SerialPortProvider` - Hardware ports (feature `hardware`)
//! - `SimulatedRadio` - Loop-back radio for tests and demos

pub mod link;
pub mod owner;
#[cfg(feature = "hardware")]
pub mod port;
pub mod sim;

pub use link::{LinkControl, LinkParts, LinkProvider};
pub use owner::TransportOwner;
#[cfg(feature = "hardware")]
pub use port::SerialPortProvider;
pub use sim::{Faults, SimCommand, SimulatedRadio};
