//! Metadata Store Error Types

use derive_more::{Display, Error};

/// A metadata store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A stored or supplied value does not fit the column/model type.
    #[display("invalid metadata: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// A failed batch is retried by the next flush cycle, so only the
    /// database-level failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Database)
    }
}
