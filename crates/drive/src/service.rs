//! Persisted service tags.

use crate::error::{Error, ErrorKind};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// The closed set of provider implementations, selected by the `service`
/// column of a drive row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Directory on local disk.
    Offline,
    /// S3-compatible object storage.
    #[cfg(feature = "s3")]
    S3,
    /// In-memory provider for tests.
    #[cfg(any(test, feature = "mock"))]
    Mock,
}

impl Service {
    pub fn tag(&self) -> &'static str {
        match self {
            Service::Offline => "offline-drive-service",
            #[cfg(feature = "s3")]
            Service::S3 => "s3-drive-service",
            #[cfg(any(test, feature = "mock"))]
            Service::Mock => "mock-drive-service",
        }
    }

    /// Description given to drives created without one.
    pub fn default_description(&self) -> &'static str {
        match self {
            Service::Offline => "Offline Cloud",
            #[cfg(feature = "s3")]
            Service::S3 => "S3 Bucket",
            #[cfg(any(test, feature = "mock"))]
            Service::Mock => "Mock Drive",
        }
    }
}

impl FromStr for Service {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline-drive-service" => Ok(Service::Offline),
            #[cfg(feature = "s3")]
            "s3-drive-service" => Ok(Service::S3),
            #[cfg(any(test, feature = "mock"))]
            "mock-drive-service" => Ok(Service::Mock),
            _ => exn::bail!(ErrorKind::UnknownService(s.to_string())),
        }
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.tag())
    }
}
