//! Drive provider trait and implementations.

#[cfg(any(test, feature = "mock"))]
mod mock;
mod offline;
#[cfg(feature = "s3")]
mod s3;

#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockProvider;
pub use self::offline::OfflineProvider;
#[cfg(feature = "s3")]
pub use self::s3::{S3Options, S3Provider};
use crate::error::Result;
use async_trait::async_trait;

/// What a provider needs to know about a chunk.
///
/// Providers never see the logical file: a chunk is an opaque blob keyed by
/// its id, tagged with the revision of the local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: String,
    pub revision: i64,
}

impl ChunkRef {
    pub fn new(id: impl Into<String>, revision: i64) -> Self {
        Self { id: id.into(), revision }
    }
}

/// Progress and cancellation hooks passed into chunk transfers.
pub trait Progress: Send + Sync {
    /// Checked between pieces of a chunk; a provider may stop early and
    /// return [`Cancelled`](crate::error::ErrorKind::Cancelled).
    fn is_cancelled(&self) -> bool;
    /// Report `bytes` more moved to or from the backend.
    fn advance(&self, bytes: u64);
}

/// A [`Progress`] that never cancels and discards updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn is_cancelled(&self) -> bool {
        false
    }
    fn advance(&self, _bytes: u64) {}
}

/// Capability interface of a storage backend that holds chunks.
///
/// The bytes handed to [`write_chunk`](Self::write_chunk) are the chunk's
/// stored form (possibly compressed), and [`read_chunk`](Self::read_chunk)
/// returns exactly those bytes. Providers must report transient conditions
/// as [`RetryAfter`](crate::error::ErrorKind::RetryAfter) so the caller can
/// retry the same chunk; any other error is treated as fatal for the
/// operation.
///
/// # Examples
///
/// ```no_run
/// use cirrus_drive::{ChunkRef, DriveProvider, NoProgress, error::Result};
///
/// async fn upload_if_stale(provider: &dyn DriveProvider, chunk: &ChunkRef, data: &[u8]) -> Result<bool> {
///     if provider.is_chunk_stale(chunk).await? == 0 {
///         return Ok(false);
///     }
///     provider.write_chunk(chunk, data, &NoProgress).await?;
///     Ok(true)
/// }
/// ```
#[async_trait]
pub trait DriveProvider: Send + Sync {
    /// Store a chunk, replacing any previous copy, and record its revision.
    async fn write_chunk(&self, chunk: &ChunkRef, data: &[u8], progress: &dyn Progress) -> Result<()>;

    /// Fetch the stored bytes of a chunk.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) when the drive
    /// holds no copy.
    async fn read_chunk(&self, chunk: &ChunkRef, progress: &dyn Progress) -> Result<Vec<u8>>;

    /// Delete a chunk. Deleting a chunk the drive does not hold succeeds.
    async fn remove_chunk(&self, chunk: &ChunkRef) -> Result<()>;

    /// Difference between the local revision and the one stored remotely.
    ///
    /// Zero means the remote copy is current. A chunk the drive does not
    /// hold at all is reported as stale (non-zero).
    async fn is_chunk_stale(&self, chunk: &ChunkRef) -> Result<i64>;

    /// Upper bound for the quota a user may assign to this drive.
    fn max_quota(&self) -> u64;

    /// Connect/prepare the backend. Called once before the drive turns ready.
    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Staleness reported for a chunk the drive has never seen.
pub(crate) fn missing_revision(chunk: &ChunkRef) -> i64 {
    chunk.revision.max(1)
}
