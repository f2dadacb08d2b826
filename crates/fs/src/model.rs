//! Node and chunk model.

use cirrus_drive::ChunkRef;
use cirrus_meta::{ChunkRecord, NodeRecord};
use std::collections::BTreeMap;
use time::UtcDateTime;

/// Id of the synthetic root directory.
pub const ROOT_ID: &str = "root";
pub const MIME_DIRECTORY: &str = "directory";
pub const MIME_DEFAULT: &str = "application/octet-stream";

/// One entry of the logical tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub mime: String,
    /// Logical length in bytes.
    pub size: u64,
    pub created: UtcDateTime,
    pub accessed: UtcDateTime,
    pub modified: UtcDateTime,
    pub trashed: bool,
    pub deleted_at: Option<UtcDateTime>,
    /// Empty for the root.
    pub parent_id: String,
    /// Chunk ids keyed by chunk index, so iteration is in offset order.
    pub chunks: BTreeMap<u64, String>,
    pub dirty: bool,
}

impl Node {
    fn new(id: String, name: String, mime: String, parent_id: String) -> Self {
        let now = UtcDateTime::now();
        Self {
            id,
            name,
            mime,
            size: 0,
            created: now,
            accessed: now,
            modified: now,
            trashed: false,
            deleted_at: None,
            parent_id,
            chunks: BTreeMap::new(),
            dirty: true,
        }
    }

    pub(crate) fn root() -> Self {
        let mut root = Self::new(ROOT_ID.to_string(), String::new(), MIME_DIRECTORY.to_string(), String::new());
        root.dirty = false;
        root
    }

    pub(crate) fn file(name: impl Into<String>, mime: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name.into(), mime.into(), parent_id.into())
    }

    pub(crate) fn directory(name: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self::file(name, MIME_DIRECTORY, parent_id)
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.mime == MIME_DIRECTORY
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// Update modification/access times and mark for flushing.
    pub(crate) fn touch(&mut self) {
        let now = UtcDateTime::now();
        self.accessed = now;
        self.modified = now;
        self.dirty = true;
    }

    pub(crate) fn record(&self) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.size,
            created: self.created,
            accessed: self.accessed,
            modified: self.modified,
            trashed: self.trashed,
            deleted_at: self.deleted_at,
            parent_id: self.parent_id.clone(),
        }
    }
}

impl From<NodeRecord> for Node {
    fn from(record: NodeRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            mime: record.mime,
            size: record.size,
            created: record.created,
            accessed: record.accessed,
            modified: record.modified,
            trashed: record.trashed,
            deleted_at: record.deleted_at,
            parent_id: record.parent_id,
            chunks: BTreeMap::new(),
            dirty: false,
        }
    }
}

/// One fixed-size extent of a node's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    /// Chunk index; the byte offset is `offset * chunk_size`.
    pub offset: u64,
    pub node_id: String,
    pub drive_id: String,
    /// Nanoseconds since the epoch of the last local write.
    pub revision: i64,
    /// Logical (uncompressed) bytes held.
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub dirty: bool,
}

impl Chunk {
    pub(crate) fn new(offset: u64, node_id: &str, drive_id: String, compressed: bool, encrypted: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            offset,
            node_id: node_id.to_string(),
            drive_id,
            revision: 0,
            size: 0,
            compressed,
            encrypted,
            dirty: true,
        }
    }

    /// What a drive provider needs to address this chunk.
    pub fn to_ref(&self) -> ChunkRef {
        ChunkRef::new(self.id.clone(), self.revision)
    }

    /// Bump the revision after a local write. Strictly increasing even when
    /// two writes land within the clock's resolution.
    pub(crate) fn bump_revision(&mut self) {
        let now = i64::try_from(UtcDateTime::now().unix_timestamp_nanos()).unwrap_or(i64::MAX);
        self.revision = now.max(self.revision.saturating_add(1));
    }

    pub(crate) fn record(&self) -> ChunkRecord {
        ChunkRecord {
            id: self.id.clone(),
            offset: self.offset,
            node_id: self.node_id.clone(),
            drive_id: self.drive_id.clone(),
            revision: self.revision,
            size: self.size,
            compressed: self.compressed,
            encrypted: self.encrypted,
        }
    }
}

impl From<ChunkRecord> for Chunk {
    fn from(record: ChunkRecord) -> Self {
        Self {
            id: record.id,
            offset: record.offset,
            node_id: record.node_id,
            drive_id: record.drive_id,
            revision: record.revision,
            size: record.size,
            compressed: record.compressed,
            encrypted: record.encrypted,
            dirty: false,
        }
    }
}
