//! Local directory drive.
//!
//! Chunks are stored as one file per chunk id under
//! `<data_dir>/drive/offline-drive-service/<drive id>/storage`, next to a
//! `<chunk id>.rev` marker holding the revision that was written. The marker
//! is what [`is_chunk_stale`](DriveProvider::is_chunk_stale) compares
//! against, since a plain directory has no notion of object versions.

use crate::error::{ErrorKind, Result};
use crate::provider::{ChunkRef, DriveProvider, Progress, missing_revision};
use crate::service::Service;
use async_trait::async_trait;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// 8 GiB
const MAX_QUOTA: u64 = 8 * 1024 * 1024 * 1024;
/// Granularity of progress updates and cancellation checks.
const PIECE_SIZE: usize = 65536;

/// Drive backed by a directory on the local filesystem.
///
/// # Examples
///
/// ```no_run
/// use cirrus_drive::OfflineProvider;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = OfflineProvider::new("/var/lib/cirrus", "5d0c7a3e")?;
/// assert!(provider.root().ends_with("5d0c7a3e/storage"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OfflineProvider {
    root: PathBuf,
}

impl OfflineProvider {
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if `data_dir` is not absolute.
    pub fn new(data_dir: impl AsRef<Path>, drive_id: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(data_dir.display().to_string()));
        }
        if drive_id.is_empty() || drive_id.contains(['/', '\\']) || drive_id == ".." {
            exn::bail!(ErrorKind::InvalidPath(drive_id.to_string()));
        }
        let root = data_dir.join("drive").join(Service::Offline.tag()).join(drive_id).join("storage");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, chunk: &ChunkRef) -> PathBuf {
        self.root.join(&chunk.id)
    }

    fn revision_path(&self, chunk: &ChunkRef) -> PathBuf {
        self.root.join(format!("{}.rev", chunk.id))
    }

    fn map_io_error(e: std::io::Error, chunk: &ChunkRef) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(chunk.id.clone()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Io(e),
        }
    }

    async fn remove_if_present(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ErrorKind::Io(e).into()),
        }
    }
}

#[async_trait]
impl DriveProvider for OfflineProvider {
    #[instrument(level = "debug", skip(self, data, progress), fields(chunk = %chunk.id, size = data.len()))]
    async fn write_chunk(&self, chunk: &ChunkRef, data: &[u8], progress: &dyn Progress) -> Result<()> {
        let path = self.chunk_path(chunk);
        let mut file = fs::File::create(&path).await.map_err(|e| Self::map_io_error(e, chunk))?;
        for piece in data.chunks(PIECE_SIZE) {
            if progress.is_cancelled() {
                drop(file);
                // A half-written copy without a marker reads as stale anyway,
                // but don't leave the bytes lying around.
                Self::remove_if_present(&path).await?;
                exn::bail!(ErrorKind::Cancelled);
            }
            file.write_all(piece).await.map_err(ErrorKind::Io)?;
            progress.advance(piece.len() as u64);
        }
        file.flush().await.map_err(ErrorKind::Io)?;
        fs::write(self.revision_path(chunk), chunk.revision.to_string()).await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, progress), fields(chunk = %chunk.id))]
    async fn read_chunk(&self, chunk: &ChunkRef, progress: &dyn Progress) -> Result<Vec<u8>> {
        if progress.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let data = fs::read(self.chunk_path(chunk)).await.map_err(|e| Self::map_io_error(e, chunk))?;
        progress.advance(data.len() as u64);
        Ok(data)
    }

    #[instrument(level = "debug", skip(self), fields(chunk = %chunk.id))]
    async fn remove_chunk(&self, chunk: &ChunkRef) -> Result<()> {
        Self::remove_if_present(&self.chunk_path(chunk)).await?;
        Self::remove_if_present(&self.revision_path(chunk)).await
    }

    async fn is_chunk_stale(&self, chunk: &ChunkRef) -> Result<i64> {
        let marker = match fs::read_to_string(self.revision_path(chunk)).await {
            Ok(marker) => marker,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(missing_revision(chunk)),
            Err(e) => return Err(ErrorKind::Io(e).into()),
        };
        let remote = marker
            .trim()
            .parse::<i64>()
            .or_raise(|| ErrorKind::Backend(format!("corrupt revision marker for chunk {}", chunk.id)))?;
        Ok(chunk.revision - remote)
    }

    fn max_quota(&self) -> u64 {
        MAX_QUOTA
    }

    #[instrument(level = "debug", skip(self), fields(root = %self.root.display()))]
    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(ErrorKind::Io)?;
        let metadata = fs::metadata(&self.root).await.map_err(ErrorKind::Io)?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(self.root.display().to_string()));
        }
        Ok(())
    }
}
