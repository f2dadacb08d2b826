//! Cirrus: a chunked, multi-backend virtual file store.
//!
//! Files live in a logical tree. Their bytes are cut into fixed-size chunks,
//! each placed on one of several drives (local directories, S3 buckets),
//! cached on local disk and fetched on demand. [`Context`] wires the pieces
//! together and runs the periodic metadata flush and transfer sweep.
//!
//! # Example
//!
//! ```no_run
//! use cirrus::{Context, Settings};
//! use cirrus::drive::Service;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Context::open(Settings::load(None)?).await?;
//! if context.drives().drives().await.is_empty() {
//!     context.drives().add(Service::Offline).await?;
//! }
//! context.start().await;
//!
//! let transfer = context.upload("/photos/cat.jpg", "cat.jpg").await?;
//! transfer.wait().await;
//! context.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;

pub use cirrus_config::Settings;
pub use cirrus_drive as drive;
pub use cirrus_fs as fs;
pub use cirrus_transfer as transfer;

use crate::error::{ErrorKind, Result};
use cirrus_drive::{DriveProviders, ServiceFactory};
use cirrus_fs::{Storage, StorageOptions};
use cirrus_meta::{Database, Repository};
use cirrus_transfer::{Connectivity, TransferInfo, TransferQueue};
use exn::ResultExt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

/// Everything a running store needs, owned in one place.
pub struct Context {
    settings: Settings,
    db: Database,
    drives: Arc<DriveProviders>,
    storage: Arc<Storage>,
    queue: Arc<TransferQueue>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    /// Validate settings, open the metadata store and load drives and
    /// nodes.
    #[instrument(skip_all, fields(database = %settings.paths.database.display()))]
    pub async fn open(settings: Settings) -> Result<Self> {
        settings.validate().or_raise(|| ErrorKind::Config)?;
        for dir in [&settings.paths.data_dir, &settings.paths.cache_dir] {
            tokio::fs::create_dir_all(dir).await.or_raise(|| ErrorKind::Io)?;
        }
        if let Some(parent) = settings.paths.database.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        }
        let db = Database::connect(&settings.paths.database).await.or_raise(|| ErrorKind::Metadata)?;
        let repo = Repository::from(&db);

        let drives = Arc::new(DriveProviders::new(repo.clone(), Self::factory(&settings)));
        drives.initialize().await.or_raise(|| ErrorKind::Drive)?;

        let options = StorageOptions {
            chunk_size: settings.chunk.size,
            compressed: settings.chunk.compressed,
            encrypted: settings.chunk.encrypted,
            compression: settings.chunk.compression,
            cache_dir: settings.paths.cache_dir.clone(),
            clear_cache_on_exit: settings.storage.clear_cache_on_exit,
        };
        let storage = Arc::new(Storage::new(repo, Arc::clone(&drives), options).or_raise(|| ErrorKind::Config)?);
        storage.initialize().await.or_raise(|| ErrorKind::Storage)?;

        let queue = Arc::new(TransferQueue::new(
            Arc::clone(&storage),
            Connectivity::default(),
            settings.transfers.parallel,
        ));
        tracing::info!("context ready");
        Ok(Self { settings, db, drives, storage, queue, jobs: Mutex::new(Vec::new()) })
    }

    fn factory(settings: &Settings) -> ServiceFactory {
        with_s3(ServiceFactory::new(&settings.paths.data_dir), settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn drives(&self) -> &Arc<DriveProviders> {
        &self.drives
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    /// Shared network flag; the host flips it as connectivity changes.
    pub fn connectivity(&self) -> &Connectivity {
        self.queue.connectivity()
    }

    /// Upload a local file to `path`, creating the node if needed.
    pub async fn upload(&self, path: &str, source: impl Into<PathBuf>) -> Result<Arc<TransferInfo>> {
        let node = self.storage.resolve_path(path).await.or_raise(|| ErrorKind::Storage)?;
        self.queue.enqueue_upload(&node.id, source).await.or_raise(|| ErrorKind::Transfer)
    }

    /// Flush nodes, chunks and drives to the metadata store.
    pub async fn synchronize(&self) -> Result<()> {
        self.storage.synchronize().await.or_raise(|| ErrorKind::Metadata)
    }

    /// Spawn the periodic metadata flush and transfer sweep.
    pub async fn start(&self) {
        let storage = Arc::clone(&self.storage);
        let flush = every(self.settings.sync_interval(), move || {
            let storage = Arc::clone(&storage);
            async move {
                if let Err(err) = storage.synchronize().await {
                    tracing::warn!(error = ?err, "metadata flush failed, retrying next cycle");
                }
            }
        });
        let queue = Arc::clone(&self.queue);
        let sweep = every(self.settings.sweep_interval(), move || {
            let queue = Arc::clone(&queue);
            async move { queue.sweep().await }
        });
        self.jobs.lock().await.extend([flush, sweep]);
        tracing::debug!("periodic jobs started");
    }

    /// Stop periodic jobs, let running transfers end, flush and close.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        for job in self.jobs.lock().await.drain(..) {
            job.abort();
        }
        self.queue.shutdown().await;
        self.storage.shutdown().await.or_raise(|| ErrorKind::Storage)?;
        self.drives.shutdown().await;
        self.db.close().await;
        tracing::info!("context closed");
        Ok(())
    }
}

#[cfg(feature = "s3")]
fn with_s3(factory: ServiceFactory, settings: &Settings) -> ServiceFactory {
    match &settings.s3 {
        Some(s3) => factory.with_s3(cirrus_drive::S3Options {
            bucket: s3.bucket.clone(),
            prefix: None,
            region: s3.region.clone(),
            endpoint: s3.endpoint.clone(),
            key_id: s3.key_id.clone(),
            key_secret: s3.key_secret.clone(),
            max_quota: s3.quota,
        }),
        None => factory,
    }
}

#[cfg(not(feature = "s3"))]
fn with_s3(factory: ServiceFactory, settings: &Settings) -> ServiceFactory {
    if settings.s3.is_some() {
        tracing::warn!("s3 settings ignored, built without the s3 feature");
    }
    factory
}

/// Run `tick` every `period`, skipping missed ticks. The first run happens
/// one period after the call.
fn every<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_drive::Service;
    use cirrus_transfer::TransferStatus;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.paths.data_dir = dir.path().join("data");
        settings.paths.cache_dir = dir.path().join("cache");
        settings.paths.database = dir.path().join("meta").join("cirrus.db");
        settings.chunk.size = 8192;
        settings.storage.sync_interval_secs = 1;
        settings.transfers.sweep_interval_ms = 10;
        settings
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.bin");
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(&source, &content).await.unwrap();

        let context = Context::open(settings(&dir)).await.unwrap();
        let drive = context.drives().add(Service::Offline).await.unwrap();
        context.start().await;
        let transfer = context.upload("/docs/report.bin", &source).await;
        // Intermediate directories are not created implicitly.
        assert!(transfer.is_err());

        let docs = context.storage().create_directory(cirrus_fs::ROOT_ID, "docs").await.unwrap();
        let transfer = context.upload("/docs/report.bin", &source).await.unwrap();
        assert_eq!(transfer.wait().await, TransferStatus::Completed);
        context.shutdown().await.unwrap();

        let context = Context::open(settings(&dir)).await.unwrap();
        let node = context.storage().resolve_path("/docs/report.bin").await.unwrap();
        assert_eq!(node.parent_id, docs.id);
        assert_eq!(node.size, 20_000);
        let chunks = context.storage().chunks_of(&node.id).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.drive_id == drive));
        assert_eq!(context.drives().drive(&drive).await.unwrap().chunks, 3);

        let target = dir.path().join("copy.bin");
        let transfer = context.queue().enqueue_download(&node.id, &target).await.unwrap();
        assert_eq!(transfer.wait().await, TransferStatus::Completed);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), content);
        context.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_periodic_flush() {
        let dir = TempDir::new().unwrap();
        let context = Context::open(settings(&dir)).await.unwrap();
        context.start().await;
        context.storage().create_directory(cirrus_fs::ROOT_ID, "d").await.unwrap();
        assert!(context.storage().pending_changes().await > 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(context.storage().pending_changes().await, 0);
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.chunk.size = 1024;
        let err = Context::open(settings).await.err().unwrap();
        assert_eq!(*err, ErrorKind::Config);
    }
}
