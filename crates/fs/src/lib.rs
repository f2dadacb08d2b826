//! Chunked node storage for cirrus.
//!
//! A file is a [`Node`] whose byte stream is cut into fixed-size [`Chunk`]s.
//! Each chunk is placed on one drive and cached locally under its id. The
//! [`Storage`] engine owns every node and chunk in memory and flushes changes
//! to the metadata store lazily; [`FileChannel`] gives random access to one
//! node's bytes on top of it.
//!
//! # Example
//!
//! ```no_run
//! use cirrus_drive::{DriveProviders, ServiceFactory};
//! use cirrus_fs::{FileChannel, Storage, StorageOptions};
//! use cirrus_meta::{Database, Repository};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::connect("/var/lib/cirrus/meta.db").await?;
//! let repo = Repository::from(&db);
//! let drives = Arc::new(DriveProviders::new(repo.clone(), ServiceFactory::new("/var/lib/cirrus")));
//! drives.initialize().await?;
//!
//! let storage = Arc::new(Storage::new(repo, drives, StorageOptions::new("/var/cache/cirrus"))?);
//! storage.initialize().await?;
//!
//! let node = storage.resolve_path("/notes.txt").await?;
//! let mut channel = FileChannel::open(Arc::clone(&storage), &node.id).await?;
//! channel.write(b"hello").await?;
//! storage.synchronize().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
pub mod error;
mod model;
mod storage;
mod tree;

pub use crate::channel::FileChannel;
pub use crate::model::{Chunk, MIME_DEFAULT, MIME_DIRECTORY, Node, ROOT_ID};
pub use crate::storage::{MIN_CHUNK_SIZE, Storage, StorageOptions};

#[cfg(test)]
pub(crate) mod testing {
    use crate::storage::{Storage, StorageOptions};
    use cirrus_drive::{DriveProviders, MockProvider, ProviderHandle, Service};
    use cirrus_meta::{Database, Repository};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub(crate) storage: Arc<Storage>,
        pub(crate) provider: Arc<MockProvider>,
        pub(crate) drives: Arc<DriveProviders>,
        pub(crate) repo: Repository,
        pub(crate) dir: TempDir,
        #[allow(dead_code)]
        pub(crate) db: Database,
    }

    pub(crate) fn mock_factory(_id: &str, _service: Service) -> cirrus_drive::error::Result<ProviderHandle> {
        Ok(Arc::new(MockProvider::default()))
    }

    async fn build(chunk_size: u64, quota: u64, configure: impl FnOnce(&mut StorageOptions)) -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let drives = Arc::new(DriveProviders::new(repo.clone(), mock_factory));
        let provider = Arc::new(MockProvider::default().with_max_quota(quota));
        drives.attach("mock", Service::Mock, "mock", quota, provider.clone()).await.unwrap();

        let dir = TempDir::new().unwrap();
        let mut options = StorageOptions::new(dir.path().join("cache"));
        options.chunk_size = chunk_size;
        configure(&mut options);
        let storage = Arc::new(Storage::new_unchecked(repo.clone(), Arc::clone(&drives), options));
        storage.initialize().await.unwrap();
        Fixture { storage, provider, drives, repo, dir, db }
    }

    /// Storage over one mock drive with `quota` bytes.
    pub(crate) async fn fixture(chunk_size: u64, quota: u64) -> Fixture {
        build(chunk_size, quota, |_| {}).await
    }

    pub(crate) async fn fixture_with(chunk_size: u64, quota: u64, compressed: bool) -> Fixture {
        build(chunk_size, quota, |options| options.compressed = compressed).await
    }

    pub(crate) async fn fixture_clearing(chunk_size: u64, quota: u64) -> Fixture {
        build(chunk_size, quota, |options| options.clear_cache_on_exit = true).await
    }
}
