//! Capability traits injected into the engine and the image cache.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    error::{CloneError, TransportError},
    types::{CloneImage, ControlLines, DeviceKey, ReadOutcome, SessionInfo},
};

/// Exclusive access to the physical serial channel.
///
/// Implemented by the host-side transport owner and by the engine-side
/// bridge proxy. The engine only ever holds one of these and issues one
/// operation at a time.
#[async_trait]
pub trait CloneTransport: Send + Sync {
    /// Open the serial session at `baud_rate`.
    async fn open(&self, baud_rate: u32) -> Result<SessionInfo, TransportError>;

    /// Close the session. Closing an already closed transport succeeds.
    async fn close(&self) -> Result<(), TransportError>;

    /// Write raw bytes, returning how many were written.
    async fn write_bytes(&self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `count` bytes, waiting at most `timeout`.
    ///
    /// A missed deadline is not an error: the outcome carries whatever
    /// arrived and `timed_out = true`.
    async fn read_bytes(&self, count: usize, timeout: Duration) -> Result<ReadOutcome, TransportError>;

    /// Clear pending input, set control lines, then wait `settle`.
    async fn prepare_clone(&self, lines: ControlLines, settle: Duration) -> Result<(), TransportError>;

    /// Drop any bytes received but not yet read.
    async fn reset_input(&self) -> Result<(), TransportError>;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Internal(String),
}

impl From<StorageError> for CloneError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Holder of the last full image per device.
///
/// Entries are only ever swapped whole; there is no partial update.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Get the cached image for `key`.
    async fn get(&self, key: &DeviceKey) -> Result<Option<CloneImage>, StorageError>;

    /// Replace the entry for the image's key, returning the previous one.
    async fn replace(&self, image: CloneImage) -> Result<Option<CloneImage>, StorageError>;

    /// Remove the entry for `key`.
    async fn remove(&self, key: &DeviceKey) -> Result<Option<CloneImage>, StorageError>;

    /// Keys with a cached image, sorted.
    async fn keys(&self) -> Result<Vec<DeviceKey>, StorageError>;
}
