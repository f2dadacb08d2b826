//! Drive Error Types
//!
//! Providers report failures through [`ErrorKind`]. The transfer layer only
//! distinguishes two classes: [`ErrorKind::RetryAfter`] (wait and try the
//! same chunk again) and everything else (the transfer fails).

use crate::status::ErrorCode;
use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::time::Duration;

/// A drive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for drive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Transient backend condition (rate limiting, temporary outage).
    #[display("backend asked to retry after {}ms", _0.as_millis())]
    RetryAfter(#[error(not(source))] Duration),
    /// The chunk is not stored on this drive.
    #[display("chunk not found on drive: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied by the backend (credentials rejected).
    #[display("permission denied")]
    PermissionDenied,
    /// Credentials were accepted once but are no longer valid.
    #[display("credentials expired")]
    CredentialsExpired,
    #[display("I/O error: {_0}")]
    Io(IoError),
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
    /// The caller's progress handle asked to stop.
    #[display("transfer cancelled")]
    Cancelled,
    /// Persisted service tag has no provider implementation.
    #[display("unknown drive service: {_0}")]
    UnknownService(#[error(not(source))] String),
    #[display("drive not found: {_0}")]
    DriveNotFound(#[error(not(source))] String),
    #[display("drive still holds chunks: {_0}")]
    DriveNotEmpty(#[error(not(source))] String),
    /// Every ready drive has exhausted its quota.
    #[display("all ready drives are full")]
    DriveFull,
    #[display("no drive is ready")]
    NoProviderAvailable,
    #[display("invalid drive state: {_0}")]
    InvalidState(#[error(not(source))] String),
    #[display("quota {_0} exceeds the drive maximum {_1}")]
    InvalidQuota(#[error(not(source))] u64, #[error(not(source))] u64),
    /// Path for a provider root is not absolute or not a directory.
    #[display("invalid drive path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// Reading or writing the `drives` table failed.
    #[display("drive metadata error")]
    Metadata,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryAfter(_) | Self::Io(_) | Self::Network(_))
    }

    /// Delay requested by the backend, if this is a transient condition.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(delay) => Some(*delay),
            _ => None,
        }
    }

    /// Status sub-code for a drive whose initialization failed with this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CredentialsExpired => ErrorCode::Expired,
            Self::PermissionDenied => ErrorCode::LoginFailed,
            Self::Network(_) | Self::RetryAfter(_) => ErrorCode::Unreachable,
            _ => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_only_set_for_transient_errors() {
        let delay = Duration::from_millis(250);
        assert_eq!(ErrorKind::RetryAfter(delay).retry_after(), Some(delay));
        assert_eq!(ErrorKind::Backend("boom".to_string()).retry_after(), None);
        assert!(ErrorKind::RetryAfter(delay).is_retryable());
        assert!(!ErrorKind::DriveFull.is_retryable());
    }

    #[test]
    fn error_codes() {
        assert_eq!(ErrorKind::PermissionDenied.error_code(), ErrorCode::LoginFailed);
        assert_eq!(ErrorKind::CredentialsExpired.error_code(), ErrorCode::Expired);
        assert_eq!(ErrorKind::Network("dns".to_string()).error_code(), ErrorCode::Unreachable);
        assert_eq!(ErrorKind::Metadata.error_code(), ErrorCode::Unknown);
    }

    #[test]
    fn display() {
        assert_eq!(ErrorKind::RetryAfter(Duration::from_secs(2)).to_string(), "backend asked to retry after 2000ms");
        assert_eq!(ErrorKind::InvalidQuota(10, 5).to_string(), "quota 10 exceeds the drive maximum 5");
    }
}
