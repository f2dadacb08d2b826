//! Local file → node → drives.

use crate::error::{ErrorKind, Result};
use crate::info::TransferInfo;
use crate::task::{BLOCK_SIZE, drive_error, retry};
use cirrus_drive::Progress;
use cirrus_fs::{FileChannel, Storage};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::instrument;

/// Copy `source` into the node, then push every chunk to its drive.
///
/// A cancelled upload deletes the node, so a half-written file never stays
/// in the tree.
#[instrument(skip_all, fields(node = %info.node_id(), source = %source.display()))]
pub(crate) async fn upload(storage: Arc<Storage>, info: Arc<TransferInfo>, source: PathBuf) -> Result<()> {
    let outcome = async {
        prepare(&storage, &info, &source).await?;
        info.checkpoint().await?;
        info.start();
        tracing::info!(size = info.size(), "upload started");
        send_chunks(&storage, &info).await
    }
    .await;
    if let Err(err) = &outcome
        && **err == ErrorKind::Cancelled
    {
        if let Err(e) = storage.delete(info.node_id()).await {
            tracing::warn!(error = ?e, "could not delete cancelled upload");
        }
    }
    outcome
}

/// Replace the node's content with the local file, allocating and caching
/// chunks along the way.
async fn prepare(storage: &Arc<Storage>, info: &TransferInfo, source: &Path) -> Result<()> {
    let mut file = File::open(source).await.or_raise(|| ErrorKind::Io)?;
    let len = file.metadata().await.or_raise(|| ErrorKind::Io)?.len();
    info.set_size(len);

    storage.truncate(info.node_id(), 0).await.or_raise(|| ErrorKind::Storage)?;
    let mut channel = FileChannel::open(Arc::clone(storage), info.node_id()).await.or_raise(|| ErrorKind::Storage)?;
    let mut block = vec![0u8; BLOCK_SIZE.min(len.max(1) as usize)];
    loop {
        let read = file.read(&mut block).await.or_raise(|| ErrorKind::Io)?;
        if read == 0 {
            return Ok(());
        }
        channel.write(&block[..read]).await.or_raise(|| ErrorKind::Storage)?;
        if info.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
    }
}

/// Write every stale chunk of the node to its drive, in offset order.
///
/// Chunks whose drive copy is already current count towards progress
/// without being sent.
pub(crate) async fn send_chunks(storage: &Storage, info: &TransferInfo) -> Result<()> {
    let chunks = storage.chunks_of(info.node_id()).await.or_raise(|| ErrorKind::Storage)?;
    for chunk in chunks {
        info.checkpoint().await?;
        let provider = storage.drives().provider(&chunk.drive_id).await.or_raise(|| ErrorKind::Drive)?;
        let provider = &*provider;
        let chunk_ref = &chunk.to_ref();

        let stale = retry(info, &chunk.id, move || provider.is_chunk_stale(chunk_ref)).await.map_err(drive_error)?;
        if stale == 0 {
            tracing::debug!(chunk = %chunk.id, "chunk up to date");
            info.advance(chunk.size);
            continue;
        }
        let data = storage.read(&chunk, true).await.or_raise(|| ErrorKind::Storage)?;
        let data = &data[..];
        let progress: &dyn Progress = info;
        retry(info, &chunk.id, move || provider.write_chunk(chunk_ref, data, progress)).await.map_err(drive_error)?;
        tracing::debug!(chunk = %chunk.id, drive = %chunk.drive_id, bytes = data.len(), "chunk uploaded");
    }
    Ok(())
}
