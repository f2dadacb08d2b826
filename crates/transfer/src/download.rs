//! Drives → node cache → local file.

use crate::error::{ErrorKind, Result};
use crate::info::TransferInfo;
use crate::task::{BLOCK_SIZE, drive_error, retry};
use cirrus_drive::Progress;
use cirrus_fs::{FileChannel, Storage};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

#[instrument(skip_all, fields(node = %info.node_id(), destination = %destination.display()))]
pub(crate) async fn download(storage: Arc<Storage>, info: Arc<TransferInfo>, destination: PathBuf) -> Result<()> {
    let node = storage.node(info.node_id()).await.or_raise(|| ErrorKind::Storage)?;
    info.set_size(node.size);
    info.start();
    tracing::info!(size = node.size, "download started");
    fetch_chunks(&storage, &info).await?;
    info.checkpoint().await?;
    export(&storage, &info, &destination).await
}

/// Bring every uncached chunk of the node into the cache, in offset order.
async fn fetch_chunks(storage: &Storage, info: &TransferInfo) -> Result<()> {
    let chunks = storage.chunks_of(info.node_id()).await.or_raise(|| ErrorKind::Storage)?;
    for chunk in chunks {
        info.checkpoint().await?;
        if storage.is_cached(&chunk).await {
            info.advance(chunk.size);
            continue;
        }
        let provider = storage.drives().provider(&chunk.drive_id).await.or_raise(|| ErrorKind::Drive)?;
        let provider = &*provider;
        let chunk_ref = &chunk.to_ref();
        let progress: &dyn Progress = info;
        let data = retry(info, &chunk.id, move || provider.read_chunk(chunk_ref, progress)).await.map_err(drive_error)?;
        storage.write(&chunk, &data, false).await.or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(chunk = %chunk.id, drive = %chunk.drive_id, bytes = data.len(), "chunk fetched");
    }
    Ok(())
}

/// Stream the node's logical bytes into `destination`, replacing it.
async fn export(storage: &Arc<Storage>, info: &TransferInfo, destination: &Path) -> Result<()> {
    let channel = FileChannel::open(Arc::clone(storage), info.node_id()).await.or_raise(|| ErrorKind::Storage)?;
    let mut file = File::create(destination).await.or_raise(|| ErrorKind::Io)?;
    let mut block = vec![0u8; BLOCK_SIZE.min(info.size().max(1) as usize)];
    let mut position = 0;
    loop {
        let read = channel.read_at(&mut block, position).await.or_raise(|| ErrorKind::Storage)?;
        if read == 0 {
            break;
        }
        file.write_all(&block[..read]).await.or_raise(|| ErrorKind::Io)?;
        position += read as u64;
    }
    file.flush().await.or_raise(|| ErrorKind::Io)
}
