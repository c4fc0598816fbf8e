//! Physical link abstraction underneath the transport owner.

use std::io;

use bytes::Bytes;
use radio_clone_core::TransportError;
use tokio::sync::mpsc;

/// Control half of an open link. Calls are short and may block briefly.
pub trait LinkControl: Send {
    /// Write all of `data` and flush.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Discard input queued on the device side.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Stop the inbound feed and release the device.
    fn close(&mut self);
}

/// An opened link: inbound chunks plus the control half.
pub struct LinkParts {
    /// Chunks as they arrive from the device. Closed when the link stops.
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
    pub control: Box<dyn LinkControl>,
}

/// Something that can open a link at a given baud rate.
pub trait LinkProvider: Send + Sync {
    /// Open the link.
    ///
    /// # Errors
    /// Returns `Unavailable` when the device cannot be opened.
    fn open(&self, baud_rate: u32) -> Result<LinkParts, TransportError>;
}
