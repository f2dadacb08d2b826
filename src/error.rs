//! Context Error Types

use derive_more::{Display, Error};

/// A cirrus error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for context operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which layer of the store failed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("invalid configuration")]
    Config,
    #[display("metadata store error")]
    Metadata,
    #[display("drive error")]
    Drive,
    #[display("storage error")]
    Storage,
    #[display("transfer error")]
    Transfer,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Metadata | ErrorKind::Drive)
    }
}
