//! Codec Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A codec error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Failed to initialize an encoder/decoder.
    Encoder,
    /// Stored chunk bytes are corrupt. Don't retry with the same input.
    #[display("invalid or corrupted data")]
    InvalidData,
    /// The requested codec name is not known.
    #[display("unsupported format: {_0}")]
    UnsupportedFormat(#[error(not(source))] String),
    /// The requested codec is known but its feature flag is off.
    #[display("disabled format: {_0}")]
    DisabledFormat(#[error(not(source))] String),
    /// Writing encoded output failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}
