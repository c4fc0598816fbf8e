//! Clone manager for orchestrating downloads and uploads.

use std::sync::Arc;

use radio_clone_core::{
    CloneContext, CloneError, CloneImage, CloneTransport, DeviceKey, ImageStore, MemoryRow,
    ProgressStore,
};
use radio_clone_engine::{CloneEngine, DeviceFamily, EngineState, FamilyRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::rows;

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub key: DeviceKey,
    pub size: usize,
    pub rows: Vec<MemoryRow>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub key: DeviceKey,
    pub size: usize,
    /// Channel slots whose bytes changed.
    pub changed: usize,
}

/// Public description of a registered family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySummary {
    pub key: DeviceKey,
    pub vendor: String,
    pub model: String,
    pub baud_rate: u32,
    pub memory_size: usize,
    pub channels: u32,
}

impl From<&DeviceFamily> for FamilySummary {
    fn from(family: &DeviceFamily) -> Self {
        Self {
            key: family.key.clone(),
            vendor: family.vendor.clone(),
            model: family.model.clone(),
            baud_rate: family.baud_rate,
            memory_size: family.memory_size,
            channels: family.channel_count(),
        }
    }
}

/// Runs clone operations and owns the image cache.
///
/// One operation runs at a time; the cache entry for a key is replaced only
/// after a transfer or import fully succeeds.
pub struct CloneManager<S>
where
    S: ImageStore,
{
    store: S,
    transport: Arc<dyn CloneTransport>,
    registry: Arc<FamilyRegistry>,
    progress: Arc<ProgressStore>,
    context: CloneContext,
    /// Serializes operations; holds the state trace of the last one.
    operation: Mutex<Vec<EngineState>>,
}

impl<S> CloneManager<S>
where
    S: ImageStore,
{
    /// Create a new clone manager.
    #[must_use]
    pub fn new(
        store: S,
        transport: Arc<dyn CloneTransport>,
        registry: Arc<FamilyRegistry>,
        context: CloneContext,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            progress: ProgressStore::shared(),
            context,
            operation: Mutex::new(Vec::new()),
        }
    }

    /// Publish progress to an existing store instead of a private one.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressStore>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressStore> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub const fn context(&self) -> &CloneContext {
        &self.context
    }

    /// Resolve a device family.
    ///
    /// # Errors
    /// Returns `UnknownDevice` for an unregistered key.
    pub fn family(&self, key: &DeviceKey) -> Result<Arc<DeviceFamily>, CloneError> {
        self.registry.get(key)
    }

    #[must_use]
    pub fn families(&self) -> Vec<FamilySummary> {
        self.registry
            .families()
            .iter()
            .map(|f| FamilySummary::from(f.as_ref()))
            .collect()
    }

    /// States visited by the most recent clone operation.
    pub async fn last_trace(&self) -> Vec<EngineState> {
        self.operation.lock().await.clone()
    }

    /// Read the radio and replace the cache entry.
    ///
    /// # Errors
    /// Returns the first failure; the cache is left untouched.
    pub async fn download(&self, key: &DeviceKey) -> Result<DownloadSummary, CloneError> {
        let family = self.registry.get(key)?;
        let mut trace = self.operation.lock().await;
        tracing::info!(%key, "Starting download");
        self.progress.push_log(format!("Downloading from {}", family.model));

        self.prepare(&family).await?;
        let mut engine = self.engine(&family);
        let result = engine.download().await;
        *trace = engine.history().to_vec();
        let image = result?;

        let rows = rows::decode_rows(&family, &image);
        let size = image.size();
        self.store.replace(image).await?;
        tracing::info!(%key, size, channels = rows.len(), "Download complete");

        Ok(DownloadSummary {
            key: key.clone(),
            size,
            rows,
        })
    }

    /// Make the cached channel table match `rows` and write it to the radio.
    /// Channels missing from `rows` are erased.
    ///
    /// # Errors
    /// `NoCachedImage` or `InvalidRow` before any transport I/O; otherwise
    /// the first transfer failure, with the cache left untouched.
    pub async fn upload(&self, key: &DeviceKey, rows: &[MemoryRow]) -> Result<UploadSummary, CloneError> {
        let family = self.registry.get(key)?;
        let mut trace = self.operation.lock().await;

        let cached = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| CloneError::NoCachedImage(key.to_string()))?;
        let (image, changed) = rows::apply_rows(&family, &cached, rows)?;
        tracing::info!(%key, rows = rows.len(), changed, "Starting upload");

        self.write(&family, image, &mut trace)
            .await
            .map(|size| UploadSummary {
                key: key.clone(),
                size,
                changed,
            })
    }

    /// Write a complete image to the radio, then cache it.
    ///
    /// # Errors
    /// `InvalidImage` when the size does not match the family; otherwise the
    /// first transfer failure.
    pub async fn upload_image(&self, key: &DeviceKey, bytes: Vec<u8>) -> Result<UploadSummary, CloneError> {
        let family = self.registry.get(key)?;
        let image = CloneImage::new(key.clone(), bytes, family.memory_size)?;
        let mut trace = self.operation.lock().await;
        tracing::info!(%key, "Restoring full image");

        let changed = match self.store.get(key).await? {
            Some(cached) => rows::changed_slots(&family, cached.bytes(), image.bytes()),
            None => rows::changed_slots(&family, &[], image.bytes()),
        };
        let size = self.write(&family, image, &mut trace).await?;
        Ok(UploadSummary {
            key: key.clone(),
            size,
            changed,
        })
    }

    /// Decode the cached image.
    ///
    /// # Errors
    /// `NoCachedImage` when nothing was downloaded or imported for `key`.
    pub async fn cached_rows(&self, key: &DeviceKey) -> Result<Vec<MemoryRow>, CloneError> {
        let family = self.registry.get(key)?;
        let image = self.export_image(key).await?;
        Ok(rows::decode_rows(&family, &image))
    }

    /// The cached image for backup.
    ///
    /// # Errors
    /// `NoCachedImage` when nothing is cached for `key`.
    pub async fn export_image(&self, key: &DeviceKey) -> Result<CloneImage, CloneError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| CloneError::NoCachedImage(key.to_string()))
    }

    /// Replace the cache entry with `bytes` without touching the radio.
    ///
    /// # Errors
    /// `InvalidImage` when the size does not match the family.
    pub async fn import_image(&self, key: &DeviceKey, bytes: Vec<u8>) -> Result<CloneImage, CloneError> {
        let family = self.registry.get(key)?;
        let image = CloneImage::new(key.clone(), bytes, family.memory_size)?;
        let _guard = self.operation.lock().await;
        self.store.replace(image.clone()).await?;
        tracing::info!(%key, size = image.size(), "Imported image");
        Ok(image)
    }

    async fn write(
        &self,
        family: &Arc<DeviceFamily>,
        image: CloneImage,
        trace: &mut Vec<EngineState>,
    ) -> Result<usize, CloneError> {
        self.progress.push_log(format!("Uploading to {}", family.model));
        self.prepare(family).await?;

        let mut engine = self.engine(family);
        let result = engine.upload(&image).await;
        *trace = engine.history().to_vec();
        result?;

        let size = image.size();
        self.store.replace(image).await?;
        tracing::info!(key = %family.key, size, "Upload complete");
        Ok(size)
    }

    async fn prepare(&self, family: &DeviceFamily) -> Result<(), CloneError> {
        self.transport
            .prepare_clone(family.lines(), self.context.timing.settle)
            .await?;
        Ok(())
    }

    fn engine(&self, family: &Arc<DeviceFamily>) -> CloneEngine {
        CloneEngine::new(
            Arc::clone(&self.transport),
            Arc::clone(family),
            self.context.timing,
        )
        .with_progress(Arc::clone(&self.progress))
    }
}
