//! Transfer Error Types

use derive_more::{Display, Error};

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transfer stopped before completing.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transfer was cancelled by the user or by a queue-wide cancel.
    #[display("transfer cancelled")]
    Cancelled,
    /// A drive failed with a non-retryable error.
    #[display("drive error")]
    Drive,
    /// The cache or node store failed.
    #[display("storage error")]
    Storage,
    /// Reading the upload source or writing the download target failed.
    #[display("local file error")]
    Io,
    /// The queue no longer accepts transfers.
    #[display("transfer queue is shut down")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if enqueueing the transfer again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Drive | ErrorKind::Storage)
    }
}
