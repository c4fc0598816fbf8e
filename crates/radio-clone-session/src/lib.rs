//! Image cache and clone orchestration.
//!
//! Provides:
//! - `CloneManager` - Run downloads, uploads and image backup/restore
//! - Row mapping between cached images and `MemoryRow`s
//! - Image store implementations

pub mod manager;
pub mod rows;
pub mod storage;

pub use manager::{CloneManager, DownloadSummary, FamilySummary, UploadSummary};
#[cfg(feature = "memory")]
pub use storage::MemoryImageStore;
