use super::{from_sql_int, to_sql_int};
use crate::error::Error;

/// Persisted form of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: String,
    /// Chunk index within the node (not a byte offset).
    pub offset: u64,
    pub node_id: String,
    pub drive_id: String,
    pub revision: i64,
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChunkRow {
    pub(crate) id: String,
    pub(crate) offset: i64,
    pub(crate) inode: String,
    pub(crate) drive: String,
    pub(crate) revision: i64,
    pub(crate) size: i64,
    pub(crate) compressed: bool,
    pub(crate) encrypted: bool,
}

impl TryFrom<&ChunkRecord> for ChunkRow {
    type Error = Error;
    fn try_from(chunk: &ChunkRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: chunk.id.clone(),
            offset: to_sql_int(chunk.offset, "chunk offset")?,
            inode: chunk.node_id.clone(),
            drive: chunk.drive_id.clone(),
            revision: chunk.revision,
            size: to_sql_int(chunk.size, "chunk size")?,
            compressed: chunk.compressed,
            encrypted: chunk.encrypted,
        })
    }
}

impl TryFrom<ChunkRow> for ChunkRecord {
    type Error = Error;
    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            offset: from_sql_int(row.offset, "chunk offset")?,
            size: from_sql_int(row.size, "chunk size")?,
            id: row.id,
            node_id: row.inode,
            drive_id: row.drive,
            revision: row.revision,
            compressed: row.compressed,
            encrypted: row.encrypted,
        })
    }
}
