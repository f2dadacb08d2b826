//! Drive providers for cirrus.
//!
//! A *drive* is one configured storage backend that chunks can be placed
//! on. This crate holds the [`DriveProvider`] capability trait, the provider
//! implementations selected by a persisted [`Service`] tag, and the
//! [`DriveProviders`] registry that tracks drive state and decides where the
//! next chunk goes.

pub mod error;
mod provider;
mod registry;
mod service;
mod status;

#[cfg(any(test, feature = "mock"))]
pub use crate::provider::MockProvider;
pub use crate::provider::OfflineProvider;
#[cfg(feature = "s3")]
pub use crate::provider::{S3Options, S3Provider};
pub use crate::provider::{ChunkRef, DriveProvider, NoProgress, Progress};
pub use crate::registry::{Drive, DriveProviders, MAX_DRIVE_QUOTA, ProviderFactory, ServiceFactory};
pub use crate::service::Service;
pub use crate::status::{ErrorCode, Status};
use std::sync::Arc;

pub type ProviderHandle = Arc<dyn DriveProvider + Send + Sync>;
