//! In-memory image cache.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use radio_clone_core::{CloneImage, DeviceKey, ImageStore, StorageError};

/// In-memory storage implementation.
///
/// One entry per device key. Data is lost on restart; use the manager's
/// export/import for backups.
pub struct MemoryImageStore {
    images: RwLock<HashMap<DeviceKey, CloneImage>>,
}

impl MemoryImageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn get(&self, key: &DeviceKey) -> Result<Option<CloneImage>, StorageError> {
        Ok(self
            .images
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    async fn replace(&self, image: CloneImage) -> Result<Option<CloneImage>, StorageError> {
        let mut images = self
            .images
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(images.insert(image.key().clone(), image))
    }

    async fn remove(&self, key: &DeviceKey) -> Result<Option<CloneImage>, StorageError> {
        Ok(self
            .images
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(key))
    }

    async fn keys(&self) -> Result<Vec<DeviceKey>, StorageError> {
        let images = self
            .images
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut keys: Vec<DeviceKey> = images.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
