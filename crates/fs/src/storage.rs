//! Storage engine: in-memory node/chunk maps, the chunk cache directory and
//! lazy persistence to the metadata store.
//!
//! All structural mutation goes through one [`Mutex`] around the maps. The
//! lock is never held while a drive provider is called or while chunk bytes
//! are read from or written to disk; callers get clones of [`Node`] and
//! [`Chunk`] back, never references into the maps.

use crate::error::{Error, ErrorKind, Result};
use crate::model::{Chunk, MIME_DEFAULT, Node, ROOT_ID};
use cirrus_compress::Compression;
use cirrus_drive::DriveProviders;
use cirrus_drive::error::{Error as DriveError, ErrorKind as DriveErrorKind};
use cirrus_meta::Repository;
use exn::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

/// Smallest chunk size accepted by [`Storage::new`].
pub const MIN_CHUNK_SIZE: u64 = 8192;

/// Tunables for a [`Storage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    pub chunk_size: u64,
    /// Defaults applied to newly allocated chunks.
    pub compressed: bool,
    pub encrypted: bool,
    /// Codec used when writing compressed chunks. Reading detects the codec
    /// from the stored bytes.
    pub compression: Compression,
    pub cache_dir: PathBuf,
    pub clear_cache_on_exit: bool,
}

impl StorageOptions {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_size: 65536,
            compressed: false,
            encrypted: false,
            compression: Compression::Gzip,
            cache_dir: cache_dir.into(),
            clear_cache_on_exit: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) nodes: HashMap<String, Node>,
    pub(crate) chunks: HashMap<String, Chunk>,
    node_dust: Vec<String>,
    chunk_dust: Vec<String>,
}

impl State {
    pub(crate) fn node(&self, id: &str) -> Result<&Node> {
        self.nodes.get(id).ok_or_raise(|| ErrorKind::NodeNotFound(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or_raise(|| ErrorKind::NodeNotFound(id.to_string()))
    }

    /// Bytes currently placed on each drive.
    fn used_space(&self) -> HashMap<&str, u64> {
        let mut used = HashMap::new();
        for chunk in self.chunks.values() {
            *used.entry(chunk.drive_id.as_str()).or_insert(0) += chunk.size;
        }
        used
    }

    pub(crate) fn insert_node(&mut self, node: Node) -> Node {
        let snapshot = node.clone();
        self.nodes.insert(node.id.clone(), node);
        snapshot
    }
}

/// Single authority over nodes, chunks and the chunk cache.
pub struct Storage {
    repo: Repository,
    drives: Arc<DriveProviders>,
    options: StorageOptions,
    state: Mutex<State>,
}

impl Storage {
    /// # Errors
    ///
    /// Returns [`Config`](ErrorKind::Config) if the chunk size is below
    /// [`MIN_CHUNK_SIZE`].
    pub fn new(repo: Repository, drives: Arc<DriveProviders>, options: StorageOptions) -> Result<Self> {
        if options.chunk_size < MIN_CHUNK_SIZE {
            exn::bail!(ErrorKind::Config(format!(
                "chunk size must be at least {MIN_CHUNK_SIZE}, got {}",
                options.chunk_size
            )));
        }
        Ok(Self::new_unchecked(repo, drives, options))
    }

    /// Like [`new`](Self::new) without the chunk size floor, so tests can
    /// use tiny chunks.
    pub(crate) fn new_unchecked(repo: Repository, drives: Arc<DriveProviders>, options: StorageOptions) -> Self {
        let mut state = State::default();
        state.insert_node(Node::root());
        Self { repo, drives, options, state: Mutex::new(state) }
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    pub fn drives(&self) -> &Arc<DriveProviders> {
        &self.drives
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().await
    }

    /// Load nodes, then chunks, from the metadata store.
    ///
    /// Chunks whose node or drive cannot be resolved are logged and dropped;
    /// they are not deleted from the store here, so a drive that comes back
    /// later in the configuration gets its chunks back on the next start.
    /// Drives must already be initialized.
    #[instrument(skip(self), fields(cache_dir = %self.options.cache_dir.display()))]
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.options.cache_dir).await.or_raise(|| ErrorKind::Io)?;
        let nodes = self.repo.fetch_nodes().await.or_raise(|| ErrorKind::Metadata)?;
        let chunks = self.repo.fetch_chunks().await.or_raise(|| ErrorKind::Metadata)?;

        let mut resolvable = Vec::with_capacity(chunks.len());
        for record in chunks {
            if self.drives.contains(&record.drive_id).await {
                resolvable.push(Chunk::from(record));
            } else {
                tracing::warn!(chunk = %record.id, drive = %record.drive_id, "dropping chunk of unknown drive");
            }
        }

        let mut state = self.lock().await;
        for record in nodes {
            if record.id == ROOT_ID {
                continue;
            }
            state.insert_node(Node::from(record));
        }
        let (mut loaded, mut dropped) = (0usize, 0usize);
        for chunk in resolvable {
            let State { nodes, chunks, .. } = &mut *state;
            let Some(node) = nodes.get_mut(&chunk.node_id) else {
                tracing::warn!(chunk = %chunk.id, node = %chunk.node_id, "dropping chunk of unknown node");
                dropped += 1;
                continue;
            };
            if let Some(existing) = node.chunks.get(&chunk.offset).and_then(|id| chunks.get(id))
                && existing.revision >= chunk.revision
            {
                tracing::warn!(chunk = %chunk.id, node = %node.id, offset = chunk.offset, "dropping duplicate chunk");
                dropped += 1;
                continue;
            }
            if let Some(replaced) = node.chunks.insert(chunk.offset, chunk.id.clone()) {
                tracing::warn!(chunk = %replaced, node = %node.id, offset = chunk.offset, "dropping duplicate chunk");
                chunks.remove(&replaced);
                dropped += 1;
                loaded -= 1;
            }
            chunks.insert(chunk.id.clone(), chunk);
            loaded += 1;
        }
        tracing::info!(nodes = state.nodes.len() - 1, chunks = loaded, dropped, "storage loaded");
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn node(&self, id: &str) -> Result<Node> {
        Ok(self.lock().await.node(id)?.clone())
    }

    pub async fn chunk(&self, id: &str) -> Result<Chunk> {
        let state = self.lock().await;
        state.chunks.get(id).cloned().ok_or_raise(|| ErrorKind::ChunkNotFound(id.to_string()))
    }

    /// The chunk of `node_id` at chunk index `offset`, if allocated.
    pub async fn chunk_at(&self, node_id: &str, offset: u64) -> Result<Option<Chunk>> {
        let state = self.lock().await;
        let node = state.node(node_id)?;
        Ok(node.chunks.get(&offset).and_then(|id| state.chunks.get(id)).cloned())
    }

    /// Chunks of a node in ascending offset order.
    pub async fn chunks_of(&self, node_id: &str) -> Result<Vec<Chunk>> {
        let state = self.lock().await;
        let node = state.node(node_id)?;
        Ok(node.chunks.values().filter_map(|id| state.chunks.get(id)).cloned().collect())
    }

    /// Bytes of chunk data currently assigned to a drive.
    pub async fn used_space(&self, drive_id: &str) -> u64 {
        self.lock().await.used_space().get(drive_id).copied().unwrap_or(0)
    }

    /// Apply `f` to a node and mark it dirty.
    pub(crate) async fn update_node<R>(&self, id: &str, f: impl FnOnce(&mut Node) -> R) -> Result<R> {
        let mut state = self.lock().await;
        let node = state.node_mut(id)?;
        let out = f(node);
        node.dirty = true;
        Ok(out)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Create a node under a directory.
    pub async fn alloc_node(&self, parent_id: &str, name: &str, mime: Option<&str>) -> Result<Node> {
        let mut state = self.lock().await;
        crate::tree::check_new_child(&state, parent_id, name, None)?;
        Ok(state.insert_node(Node::file(name, mime.unwrap_or(MIME_DEFAULT), parent_id)))
    }

    /// Allocate the chunk at `offset` of a node on the drive with the most
    /// remaining quota.
    ///
    /// Returns the existing chunk if one is already allocated at that index.
    /// Nothing is registered when allocation fails.
    #[instrument(level = "debug", skip(self))]
    pub async fn alloc(&self, node_id: &str, offset: u64) -> Result<Chunk> {
        let mut state = self.lock().await;
        let node = state.node(node_id)?;
        if node.is_directory() {
            exn::bail!(ErrorKind::InvalidOperation(format!("directory {node_id} cannot hold chunks")));
        }
        if let Some(existing) = node.chunks.get(&offset).and_then(|id| state.chunks.get(id)) {
            return Ok(existing.clone());
        }
        let drive_id = {
            let used = state.used_space();
            self.drives
                .next_allocatable(|drive| used.get(drive).copied().unwrap_or(0))
                .await
                .map_err(allocation_error)?
        };
        self.drives.increment_chunks(&drive_id).await.map_err(|e| e.raise(ErrorKind::Drive))?;
        let chunk = Chunk::new(offset, node_id, drive_id, self.options.compressed, self.options.encrypted);
        state.node_mut(node_id)?.chunks.insert(offset, chunk.id.clone());
        state.chunks.insert(chunk.id.clone(), chunk.clone());
        tracing::debug!(chunk = %chunk.id, drive = %chunk.drive_id, "chunk allocated");
        Ok(chunk)
    }

    // =========================================================================
    // Cache I/O
    // =========================================================================

    pub fn cache_path(&self, chunk: &Chunk) -> PathBuf {
        self.options.cache_dir.join(&chunk.id)
    }

    pub async fn is_cached(&self, chunk: &Chunk) -> bool {
        fs::try_exists(self.cache_path(chunk)).await.unwrap_or(false)
    }

    /// Store chunk bytes in the cache.
    ///
    /// With `raw` set, `bytes` is plain file content and is compressed when
    /// the chunk is flagged as compressed. Without it, `bytes` is already in
    /// stored form (as returned by a drive) and is written verbatim.
    ///
    /// Bumps the revision, records the logical size and marks the chunk
    /// dirty. Returns the updated chunk.
    #[instrument(level = "debug", skip(self, chunk, bytes), fields(chunk = %chunk.id, len = bytes.len()))]
    pub async fn write(&self, chunk: &Chunk, bytes: &[u8], raw: bool) -> Result<Chunk> {
        let (stored, logical_size) = match (raw, chunk.compressed) {
            (true, true) => {
                let encoded = self.options.compression.compress(bytes).or_raise(|| ErrorKind::Codec)?;
                (encoded, bytes.len() as u64)
            },
            (false, true) => {
                let size = Compression::decompress_detect(bytes).or_raise(|| ErrorKind::Codec)?.len() as u64;
                (bytes.to_vec(), size)
            },
            (_, false) => (bytes.to_vec(), bytes.len() as u64),
        };
        if !self.lock().await.chunks.contains_key(&chunk.id) {
            exn::bail!(ErrorKind::ChunkNotFound(chunk.id.clone()));
        }
        let path = self.cache_path(chunk);
        fs::write(&path, &stored).await.or_raise(|| ErrorKind::Io)?;

        let mut state = self.lock().await;
        if !state.chunks.contains_key(&chunk.id) {
            // Freed while the bytes were being written.
            drop(state);
            remove_if_present(&path).await?;
            exn::bail!(ErrorKind::ChunkNotFound(chunk.id.clone()));
        }
        let current = state.chunks.get_mut(&chunk.id).ok_or_raise(|| ErrorKind::ChunkNotFound(chunk.id.clone()))?;
        current.bump_revision();
        current.size = logical_size;
        current.dirty = true;
        Ok(current.clone())
    }

    /// Read chunk bytes from the cache.
    ///
    /// With `raw` set the stored form is returned (what drives receive);
    /// otherwise compressed chunks are decoded.
    ///
    /// # Errors
    ///
    /// [`NotCached`](ErrorKind::NotCached) when the chunk has to be fetched
    /// from its drive first.
    pub async fn read(&self, chunk: &Chunk, raw: bool) -> Result<Vec<u8>> {
        let stored = match fs::read(self.cache_path(chunk)).await {
            Ok(stored) => stored,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotCached(chunk.id.clone()))
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
        };
        if raw || !chunk.compressed {
            return Ok(stored);
        }
        Compression::decompress_detect(&stored).or_raise(|| ErrorKind::Codec)
    }

    /// Total size of the files in the cache directory.
    pub async fn cached_size(&self) -> Result<u64> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.options.cache_dir).await.or_raise(|| ErrorKind::Io)?;
        while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
            let metadata = entry.metadata().await.or_raise(|| ErrorKind::Io)?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Release a chunk: drop it from memory, delete it from its drive and
    /// the cache, and queue its row for deletion.
    ///
    /// Transient drive errors are retried; a fatal one is logged and the
    /// release carries on so cleanup is never blocked by an unreachable
    /// drive.
    #[instrument(level = "debug", skip(self))]
    pub async fn free_chunk(&self, chunk_id: &str) -> Result<()> {
        let chunk = {
            let mut state = self.lock().await;
            let chunk = state.chunks.remove(chunk_id).ok_or_raise(|| ErrorKind::ChunkNotFound(chunk_id.to_string()))?;
            if let Some(node) = state.nodes.get_mut(&chunk.node_id)
                && node.chunks.get(&chunk.offset).is_some_and(|id| id == chunk_id)
            {
                node.chunks.remove(&chunk.offset);
            }
            state.chunk_dust.push(chunk.id.clone());
            chunk
        };
        self.remove_from_drive(&chunk).await;
        if let Err(err) = self.drives.decrement_chunks(&chunk.drive_id).await {
            tracing::warn!(chunk = %chunk.id, error = %err, "drive gone before chunk release");
        }
        remove_if_present(&self.cache_path(&chunk)).await
    }

    async fn remove_from_drive(&self, chunk: &Chunk) {
        let provider = match self.drives.provider(&chunk.drive_id).await {
            Ok(provider) => provider,
            Err(err) => {
                tracing::warn!(chunk = %chunk.id, error = %err, "skipping drive deletion");
                return;
            },
        };
        let chunk_ref = chunk.to_ref();
        loop {
            match provider.remove_chunk(&chunk_ref).await {
                Ok(()) => return,
                Err(err) => match err.retry_after() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        tracing::warn!(chunk = %chunk.id, drive = %chunk.drive_id, error = %err, "giving up on drive deletion");
                        return;
                    },
                },
            }
        }
    }

    /// Release a node and all of its chunks.
    ///
    /// Directories must be empty; see [`delete`](Self::delete) for subtrees.
    #[instrument(level = "debug", skip(self))]
    pub async fn free_node(&self, node_id: &str) -> Result<()> {
        let chunk_ids: Vec<String> = {
            let state = self.lock().await;
            let node = state.node(node_id)?;
            if node.is_root() {
                exn::bail!(ErrorKind::InvalidOperation("the root cannot be freed".to_string()));
            }
            if node.is_directory() && state.nodes.values().any(|other| other.parent_id == node_id) {
                exn::bail!(ErrorKind::InvalidOperation(format!("directory {node_id} is not empty")));
            }
            node.chunks.values().cloned().collect()
        };
        for chunk_id in chunk_ids {
            self.free_chunk(&chunk_id).await?;
        }
        let mut state = self.lock().await;
        if state.nodes.remove(node_id).is_some() {
            state.node_dust.push(node_id.to_string());
        }
        Ok(())
    }

    /// Shrink or extend a file to `len` bytes.
    ///
    /// Chunks entirely past the new end are freed and the last one is cut.
    /// Extending allocates empty chunks up to the new end, which read as
    /// zeros.
    #[instrument(level = "debug", skip(self))]
    pub async fn truncate(&self, node_id: &str, len: u64) -> Result<()> {
        let size = self.chunk_size();
        let (beyond, last, current) = {
            let state = self.lock().await;
            let node = state.node(node_id)?;
            if node.is_directory() {
                exn::bail!(ErrorKind::InvalidOperation(format!("cannot truncate directory {node_id}")));
            }
            let current = node.size;
            let keep = len.div_ceil(size);
            let beyond: Vec<String> = node.chunks.range(keep..).map(|(_, id)| id.clone()).collect();
            let last = match len % size {
                0 => None,
                tail => node
                    .chunks
                    .get(&(len / size))
                    .and_then(|id| state.chunks.get(id))
                    .filter(|chunk| chunk.size > tail)
                    .map(|chunk| (chunk.clone(), tail)),
            };
            (beyond, last, current)
        };
        if len > current {
            self.extend(node_id, current / size, (len - 1) / size).await?;
        }
        for chunk_id in beyond {
            self.free_chunk(&chunk_id).await?;
        }
        if let Some((chunk, tail)) = last {
            let mut content = self.read(&chunk, false).await?;
            content.truncate(tail as usize);
            self.write(&chunk, &content, true).await?;
        }
        self.update_node(node_id, |node| {
            node.size = len;
            node.touch();
        })
        .await
    }

    /// Allocate every missing chunk index in `first..=last` as an empty,
    /// cached chunk. On failure the chunks allocated here are released.
    async fn extend(&self, node_id: &str, first: u64, last: u64) -> Result<()> {
        let mut fresh = Vec::new();
        let mut outcome = Ok(());
        for index in first..=last {
            if self.chunk_at(node_id, index).await?.is_some() {
                continue;
            }
            let step = async {
                let chunk = self.alloc(node_id, index).await?;
                fresh.push(chunk.id.clone());
                self.write(&chunk, &[], true).await.map(|_| ())
            };
            if let Err(err) = step.await {
                outcome = Err(err);
                break;
            }
        }
        if outcome.is_err() {
            for chunk_id in fresh.into_iter().rev() {
                if let Err(err) = self.free_chunk(&chunk_id).await {
                    tracing::warn!(chunk = %chunk_id, error = %err, "could not release chunk of a failed extension");
                }
            }
        }
        outcome
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush dirty nodes and chunks, then deletions, then the drive registry.
    ///
    /// Flags are cleared up front and restored if a batch fails, so
    /// mutations that race with the flush are never lost and the next call
    /// retries the same work.
    #[instrument(skip(self))]
    pub async fn synchronize(&self) -> Result<()> {
        let (nodes, chunks, node_dust, chunk_dust) = {
            let mut state = self.lock().await;
            let nodes: Vec<_> = state
                .nodes
                .values_mut()
                .filter(|node| node.dirty && !node.is_root())
                .map(|node| {
                    node.dirty = false;
                    node.record()
                })
                .collect();
            let chunks: Vec<_> = state
                .chunks
                .values_mut()
                .filter(|chunk| chunk.dirty)
                .map(|chunk| {
                    chunk.dirty = false;
                    chunk.record()
                })
                .collect();
            (nodes, chunks, std::mem::take(&mut state.node_dust), std::mem::take(&mut state.chunk_dust))
        };
        let pending = nodes.len() + chunks.len() + node_dust.len() + chunk_dust.len();
        if pending > 0 {
            let result = async {
                self.repo.upsert_nodes(&nodes).await?;
                self.repo.upsert_chunks(&chunks).await?;
                self.repo.delete_chunks(&chunk_dust).await?;
                self.repo.delete_nodes(&node_dust).await
            }
            .await;
            if let Err(err) = result {
                let mut state = self.lock().await;
                for record in &nodes {
                    if let Some(node) = state.nodes.get_mut(&record.id) {
                        node.dirty = true;
                    }
                }
                for record in &chunks {
                    if let Some(chunk) = state.chunks.get_mut(&record.id) {
                        chunk.dirty = true;
                    }
                }
                state.node_dust.extend(node_dust);
                state.chunk_dust.extend(chunk_dust);
                return Err(err.raise(ErrorKind::Metadata));
            }
            tracing::debug!(
                nodes = nodes.len(),
                chunks = chunks.len(),
                deleted_nodes = node_dust.len(),
                deleted_chunks = chunk_dust.len(),
                "storage synchronized"
            );
        }
        self.drives.synchronize().await.map_err(|e| e.raise(ErrorKind::Metadata))
    }

    /// Number of dirty nodes/chunks plus queued deletions.
    pub async fn pending_changes(&self) -> usize {
        let state = self.lock().await;
        state.nodes.values().filter(|node| node.dirty).count()
            + state.chunks.values().filter(|chunk| chunk.dirty).count()
            + state.node_dust.len()
            + state.chunk_dust.len()
    }

    /// Final flush, then optionally empty the cache directory.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.synchronize().await?;
        if self.options.clear_cache_on_exit {
            let mut entries = fs::read_dir(&self.options.cache_dir).await.or_raise(|| ErrorKind::Io)?;
            while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
                remove_if_present(&entry.path()).await?;
            }
            tracing::info!("chunk cache cleared");
        }
        Ok(())
    }
}

fn allocation_error(err: DriveError) -> Error {
    let kind = match &*err {
        DriveErrorKind::DriveFull => ErrorKind::DriveFull,
        DriveErrorKind::NoProviderAvailable => ErrorKind::NoProviderAvailable,
        _ => ErrorKind::Drive,
    };
    err.raise(kind)
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).or_raise(|| ErrorKind::Io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, fixture};
    use cirrus_drive::{DriveProvider, MockProvider, Service};
    use cirrus_meta::{ChunkRecord, NodeRecord};
    use std::time::Duration;
    use time::UtcDateTime;

    #[tokio::test]
    async fn test_rejects_small_chunk_size() {
        let db = cirrus_meta::Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let drives = Arc::new(DriveProviders::new(repo.clone(), crate::testing::mock_factory));
        let mut options = StorageOptions::new("/tmp/cirrus-cache");
        options.chunk_size = 4096;
        let err = Storage::new(repo, drives, options).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Config(_)));
    }

    #[tokio::test]
    async fn test_alloc_is_idempotent_per_index() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let first = storage.alloc(&node.id, 0).await.unwrap();
        let again = storage.alloc(&node.id, 0).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(storage.chunks_of(&node.id).await.unwrap().len(), 1);
        let drive = storage.drives().drive("mock").await.unwrap();
        assert_eq!(drive.chunks, 1);
        assert!(drive.dirty);
    }

    #[tokio::test]
    async fn test_alloc_exhaustion_registers_nothing() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 4).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        storage.write(&chunk, &[1, 2, 3, 4], true).await.unwrap();

        let err = storage.alloc(&node.id, 1).await.unwrap_err();
        assert_eq!(*err, ErrorKind::DriveFull);
        assert!(storage.chunk_at(&node.id, 1).await.unwrap().is_none());
        assert_eq!(storage.drives().drive("mock").await.unwrap().chunks, 1);

        storage.drives().disable("mock").await.unwrap();
        let err = storage.alloc(&node.id, 1).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NoProviderAvailable);
    }

    #[tokio::test]
    async fn test_alloc_spreads_by_remaining_capacity() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 8).await;
        storage
            .drives()
            .attach("second", Service::Mock, "second", 6, Arc::new(MockProvider::default()))
            .await
            .unwrap();
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let first = storage.alloc(&node.id, 0).await.unwrap();
        assert_eq!(first.drive_id, "mock");
        storage.write(&first, &[0; 4], true).await.unwrap();
        // mock: 8 - 4 = 4 remaining, second: 6 remaining.
        let second = storage.alloc(&node.id, 1).await.unwrap();
        assert_eq!(second.drive_id, "second");
    }

    #[tokio::test]
    async fn test_write_read_raw_and_compressed() {
        let Fixture { storage, dir: _dir, .. } = crate::testing::fixture_with(8192, u64::MAX, true).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        assert!(chunk.compressed);
        assert!(!storage.is_cached(&chunk).await);
        let err = storage.read(&chunk, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotCached(_)));

        let content = vec![42u8; 4000];
        let chunk = storage.write(&chunk, &content, true).await.unwrap();
        assert!(storage.is_cached(&chunk).await);
        assert_eq!(chunk.size, 4000);
        assert!(chunk.dirty);

        let stored = storage.read(&chunk, true).await.unwrap();
        assert_eq!(Compression::from_magic_bytes(&stored), Compression::Gzip);
        assert!(stored.len() < content.len());
        assert_eq!(storage.read(&chunk, false).await.unwrap(), content);

        // Stored-form bytes go to disk untouched and keep the logical size.
        let rewritten = storage.write(&chunk, &stored, false).await.unwrap();
        assert_eq!(rewritten.size, 4000);
        assert!(rewritten.revision > chunk.revision);
        assert_eq!(storage.read(&rewritten, true).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_free_chunk_releases_everything() {
        let Fixture { storage, provider, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        let chunk = storage.write(&chunk, &[1, 2], true).await.unwrap();
        provider.write_chunk(&chunk.to_ref(), &[1, 2], &cirrus_drive::NoProgress).await.unwrap();
        provider.retry_next(2, Duration::from_millis(1));

        storage.free_chunk(&chunk.id).await.unwrap();
        assert!(storage.chunk_at(&node.id, 0).await.unwrap().is_none());
        assert!(!storage.is_cached(&chunk).await);
        assert!(provider.stored(&chunk.id).await.is_none());
        assert_eq!(storage.drives().drive("mock").await.unwrap().chunks, 0);
    }

    #[tokio::test]
    async fn test_write_to_freed_chunk_leaves_no_cache_file() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        storage.free_chunk(&chunk.id).await.unwrap();

        let err = storage.write(&chunk, &[1, 2, 3], true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ChunkNotFound(_)));
        assert!(!storage.is_cached(&chunk).await);
    }

    #[tokio::test]
    async fn test_free_chunk_survives_fatal_drive_error() {
        let Fixture { storage, provider, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        provider.fail_next(1);
        storage.free_chunk(&chunk.id).await.unwrap();
        assert!(storage.chunk(&chunk.id).await.is_err());
    }

    #[tokio::test]
    async fn test_free_node_rejects_root_and_non_empty_directories() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 1024).await;
        let err = storage.free_node(ROOT_ID).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidOperation(_)));
        let dir = storage.create_directory(ROOT_ID, "d").await.unwrap();
        storage.alloc_node(&dir.id, "f", None).await.unwrap();
        assert!(storage.free_node(&dir.id).await.is_err());
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let Fixture { storage, repo, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        storage.write(&chunk, &[1, 2, 3], true).await.unwrap();
        assert!(storage.pending_changes().await > 0);

        storage.synchronize().await.unwrap();
        assert_eq!(storage.pending_changes().await, 0);
        storage.synchronize().await.unwrap();
        assert_eq!(storage.pending_changes().await, 0);

        assert_eq!(repo.fetch_nodes().await.unwrap().len(), 1);
        let chunks = repo.fetch_chunks().await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 3);
        // The root is never persisted.
        assert!(repo.fetch_nodes().await.unwrap().iter().all(|n| n.id != ROOT_ID));
    }

    #[tokio::test]
    async fn test_synchronize_flushes_deletions() {
        let Fixture { storage, repo, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        storage.alloc(&node.id, 0).await.unwrap();
        storage.synchronize().await.unwrap();

        storage.free_node(&node.id).await.unwrap();
        storage.synchronize().await.unwrap();
        assert!(repo.fetch_nodes().await.unwrap().is_empty());
        assert!(repo.fetch_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_drops_orphans() {
        let Fixture { storage, repo, dir, drives, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "kept", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        storage.synchronize().await.unwrap();

        let orphan = |id: &str, node: &str, drive: &str| ChunkRecord {
            id: id.to_string(),
            offset: 0,
            node_id: node.to_string(),
            drive_id: drive.to_string(),
            revision: 1,
            size: 0,
            compressed: false,
            encrypted: false,
        };
        repo.upsert_chunks(&[orphan("no-node", "missing", "mock"), orphan("no-drive", &node.id, "missing")])
            .await
            .unwrap();

        let mut options = StorageOptions::new(dir.path().join("cache"));
        options.chunk_size = 4;
        let reloaded = Storage::new_unchecked(repo.clone(), drives, options);
        reloaded.initialize().await.unwrap();
        assert!(reloaded.chunk("no-node").await.is_err());
        assert!(reloaded.chunk("no-drive").await.is_err());
        let chunks = reloaded.chunks_of(&node.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, chunk.id);
    }

    #[tokio::test]
    async fn test_initialize_keeps_newest_duplicate() {
        let Fixture { repo, dir, drives, .. } = fixture(4, 1024).await;
        let now = UtcDateTime::now();
        repo.upsert_nodes(&[NodeRecord {
            id: "n1".to_string(),
            name: "a".to_string(),
            mime: MIME_DEFAULT.to_string(),
            size: 4,
            created: now,
            accessed: now,
            modified: now,
            trashed: false,
            deleted_at: None,
            parent_id: ROOT_ID.to_string(),
        }])
        .await
        .unwrap();
        let chunk = |id: &str, revision: i64| ChunkRecord {
            id: id.to_string(),
            offset: 0,
            node_id: "n1".to_string(),
            drive_id: "mock".to_string(),
            revision,
            size: 4,
            compressed: false,
            encrypted: false,
        };
        repo.upsert_chunks(&[chunk("old", 1), chunk("new", 2)]).await.unwrap();

        let mut options = StorageOptions::new(dir.path().join("cache"));
        options.chunk_size = 4;
        let storage = Storage::new_unchecked(repo, drives, options);
        storage.initialize().await.unwrap();
        let chunks = storage.chunks_of("n1").await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["new"]);
    }

    #[tokio::test]
    async fn test_truncate() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let mut channel = crate::FileChannel::open(Arc::clone(&storage), &node.id).await.unwrap();
        channel.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).await.unwrap();
        assert_eq!(storage.chunks_of(&node.id).await.unwrap().len(), 3);

        storage.truncate(&node.id, 6).await.unwrap();
        let chunks = storage.chunks_of(&node.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].size, 2);
        assert_eq!(storage.node(&node.id).await.unwrap().size, 6);

        let mut buf = [0u8; 16];
        let n = channel.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_truncate_extends_with_empty_chunks() {
        let Fixture { storage, dir: _dir, .. } = fixture(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let channel = crate::FileChannel::open(Arc::clone(&storage), &node.id).await.unwrap();
        channel.write_at(&[1, 2], 0).await.unwrap();

        storage.truncate(&node.id, 10).await.unwrap();
        let chunks = storage.chunks_of(&node.id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.offset).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(storage.node(&node.id).await.unwrap().size, 10);

        let mut buf = [0xff; 16];
        assert_eq!(channel.read_at(&mut buf, 0).await.unwrap(), 10);
        assert_eq!(&buf[..10], &[1, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_cached_size_and_shutdown_clear() {
        let Fixture { storage, dir: _dir, .. } = crate::testing::fixture_clearing(4, 1024).await;
        let node = storage.alloc_node(ROOT_ID, "a", None).await.unwrap();
        let chunk = storage.alloc(&node.id, 0).await.unwrap();
        storage.write(&chunk, &[1, 2, 3], true).await.unwrap();
        assert_eq!(storage.cached_size().await.unwrap(), 3);

        storage.shutdown().await.unwrap();
        assert_eq!(storage.cached_size().await.unwrap(), 0);
        assert_eq!(storage.pending_changes().await, 0);
    }
}
