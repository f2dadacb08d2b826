//! Seekable byte channel over one node.

use crate::error::{ErrorKind, Result};
use crate::storage::Storage;
use exn::OptionExt;
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::instrument;

/// Random access to a node's logical byte stream.
///
/// Reads and writes go through the [`Storage`] cache only; chunks that are
/// not cached have to be fetched by a download first.
pub struct FileChannel {
    storage: Arc<Storage>,
    node_id: String,
    position: u64,
}

impl std::fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChannel").field("node_id", &self.node_id).field("position", &self.position).finish()
    }
}

impl FileChannel {
    /// Open a channel positioned at the start of a file.
    pub async fn open(storage: Arc<Storage>, node_id: &str) -> Result<Self> {
        let node = storage.node(node_id).await?;
        if node.is_directory() {
            exn::bail!(ErrorKind::InvalidOperation(format!("{} is a directory", node.name)));
        }
        Ok(Self { storage, node_id: node.id, position: 0 })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn size(&self) -> Result<u64> {
        Ok(self.storage.node(&self.node_id).await?.size)
    }

    /// Read into `buf` starting at `position`, returning the number of bytes
    /// read. Zero means end of stream.
    ///
    /// Bytes inside the file size that no chunk content covers read as
    /// zeros.
    #[instrument(level = "trace", skip(self, buf), fields(node = %self.node_id, len = buf.len()))]
    pub async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let size = self.size().await?;
        if position >= size || buf.is_empty() {
            return Ok(0);
        }
        let chunk_size = self.storage.chunk_size();
        let end = size.min(position.saturating_add(buf.len() as u64));
        let mut pos = position;
        while pos < end {
            let index = pos / chunk_size;
            let within = (pos % chunk_size) as usize;
            let take = (chunk_size - within as u64).min(end - pos) as usize;
            let chunk = self
                .storage
                .chunk_at(&self.node_id, index)
                .await?
                .ok_or_raise(|| ErrorKind::ChunkMissing(self.node_id.clone(), index))?;
            let data = self.storage.read(&chunk, false).await?;

            let out = &mut buf[(pos - position) as usize..][..take];
            let available = data.len().saturating_sub(within).min(take);
            if available > 0 {
                out[..available].copy_from_slice(&data[within..within + available]);
            }
            out[available..].fill(0);
            pos += take as u64;
        }
        Ok((end - position) as usize)
    }

    /// Write `buf` at `position`, allocating chunks as needed. Returns the
    /// number of bytes written.
    ///
    /// Every chunk index between the current end of the file and the end of
    /// the write is allocated before the size moves, so a write past the end
    /// leaves empty chunks (reading as zeros) behind it. If any allocation
    /// fails, the chunks allocated by this call are released and the node is
    /// left untouched.
    #[instrument(level = "trace", skip(self, buf), fields(node = %self.node_id, len = buf.len()))]
    pub async fn write_at(&self, buf: &[u8], position: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = position
            .checked_add(buf.len() as u64)
            .ok_or_raise(|| ErrorKind::InvalidOperation("write past the largest file offset".to_string()))?;
        let chunk_size = self.storage.chunk_size();
        let first_written = position / chunk_size;
        let first = self.size().await?.min(position) / chunk_size;
        let last = (end - 1) / chunk_size;

        let mut chunks = Vec::new();
        let mut fresh = Vec::new();
        for index in first..=last {
            let existed = self.storage.chunk_at(&self.node_id, index).await?.is_some();
            match self.storage.alloc(&self.node_id, index).await {
                Ok(chunk) => {
                    if !existed {
                        fresh.push(chunk.id.clone());
                    }
                    chunks.push(chunk);
                },
                Err(err) => {
                    self.release(fresh).await;
                    return Err(err);
                },
            }
        }

        // Size and times are recorded before any chunk is touched.
        self.storage
            .update_node(&self.node_id, |node| {
                node.size = node.size.max(end);
                node.touch();
            })
            .await?;

        for chunk in chunks {
            let index = chunk.offset;
            if index < first_written {
                // Gap chunks get an empty cache entry so they can be read and
                // uploaded like any other.
                if fresh.contains(&chunk.id) {
                    self.storage.write(&chunk, &[], true).await?;
                }
                continue;
            }
            let chunk_start = index * chunk_size;
            let pos = position.max(chunk_start);
            let within = (pos - chunk_start) as usize;
            let take = (chunk_size - within as u64).min(end - pos) as usize;
            let input = &buf[(pos - position) as usize..][..take];

            if within == 0 && take as u64 == chunk_size {
                self.storage.write(&chunk, input, true).await?;
            } else {
                let mut content = match chunk.size {
                    0 => Vec::new(),
                    _ => self.storage.read(&chunk, false).await?,
                };
                if content.len() < within + take {
                    content.resize(within + take, 0);
                }
                content[within..within + take].copy_from_slice(input);
                self.storage.write(&chunk, &content, true).await?;
            }
        }
        Ok(buf.len())
    }

    /// Undo allocations of a write that could not complete.
    async fn release(&self, chunk_ids: Vec<String>) {
        for chunk_id in chunk_ids.into_iter().rev() {
            if let Err(err) = self.storage.free_chunk(&chunk_id).await {
                tracing::warn!(chunk = %chunk_id, error = %err, "could not release chunk of a failed write");
            }
        }
    }

    /// Read at the cursor and advance it.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self.read_at(buf, self.position).await?;
        self.position += read as u64;
        Ok(read)
    }

    /// Write at the cursor and advance it.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let written = self.write_at(buf, self.position).await?;
        self.position += written as u64;
        Ok(written)
    }

    /// Move the cursor. Seeking past the end is allowed; a later write
    /// leaves a hole.
    pub async fn seek(&mut self, target: SeekFrom) -> Result<u64> {
        let (base, delta) = match target {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            },
            SeekFrom::End(delta) => (self.size().await?, delta),
            SeekFrom::Current(delta) => (self.position, delta),
        };
        match base.checked_add_signed(delta) {
            Some(position) => {
                self.position = position;
                Ok(position)
            },
            None => exn::bail!(ErrorKind::InvalidOperation("seek before the start of the file".to_string())),
        }
    }

    pub async fn truncate(&self, len: u64) -> Result<()> {
        self.storage.truncate(&self.node_id, len).await
    }
}
