//! File Store Error Types

use derive_more::{Display, Error};

/// A file store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for file store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A path could not be walked (missing segment, file used as directory,
    /// cycle in the parent chain).
    #[display("cannot resolve: {_0}")]
    Resolution(#[error(not(source))] String),
    #[display("node not found: {_0}")]
    NodeNotFound(#[error(not(source))] String),
    #[display("chunk not found: {_0}")]
    ChunkNotFound(#[error(not(source))] String),
    /// A node has no chunk at an index inside its size. Metadata is corrupt.
    #[display("node {_0} has no chunk at index {_1}")]
    ChunkMissing(#[error(not(source))] String, #[error(not(source))] u64),
    /// The chunk is not in the local cache and must be fetched from its drive first.
    #[display("chunk not cached: {_0}")]
    NotCached(#[error(not(source))] String),
    #[display("name already taken: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    #[display("invalid name: {_0:?}")]
    InvalidName(#[error(not(source))] String),
    #[display("invalid operation: {_0}")]
    InvalidOperation(#[error(not(source))] String),
    /// Every ready drive is full.
    #[display("no space left on any drive")]
    DriveFull,
    #[display("no drive available for allocation")]
    NoProviderAvailable,
    /// Any other drive registry or provider failure.
    #[display("drive error")]
    Drive,
    #[display("chunk codec error")]
    Codec,
    #[display("I/O error")]
    Io,
    #[display("metadata store error")]
    Metadata,
    #[display("invalid configuration: {_0}")]
    Config(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Metadata | ErrorKind::Drive)
    }
}
