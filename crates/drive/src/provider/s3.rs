//! S3-compatible drive.
//!
//! One object per chunk, keyed by chunk id under an optional prefix. The
//! chunk revision is stored as user metadata on the object so staleness can
//! be checked with a `HEAD` request instead of downloading the chunk.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file
//! (`key_id`/`key_secret`), which fits S3-compatible services such as
//! Backblaze B2, Tigris or MinIO.

use crate::error::{ErrorKind, Result};
use crate::provider::{ChunkRef, DriveProvider, Progress, missing_revision};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
};
use exn::ResultExt;
use std::time::Duration;
use tracing::instrument;

const REVISION_KEY: &str = "revision";
/// Used when a throttling response carries no `Retry-After` header.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for an [`S3Provider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Options {
    pub bucket: String,
    pub prefix: Option<String>,
    pub region: String,
    /// Custom endpoint URL for non-AWS services.
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
    /// Largest quota a user may assign to the drive.
    pub max_quota: u64,
}

/// Drive backed by an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Provider {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    max_quota: u64,
}

impl S3Provider {
    pub fn new(options: S3Options) -> Self {
        let credentials = Credentials::new(options.key_id, options.key_secret, None, None, "cirrus-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(options.region))
            // 1 initial + 3 retries with exponential backoff; throttling that
            // outlasts these surfaces as RetryAfter to the transfer layer.
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services.
            .force_path_style(true);
        if let Some(endpoint_url) = options.endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self {
            client: Client::from_conf(config_builder.build()),
            bucket: options.bucket,
            prefix: options.prefix,
            max_quota: options.max_quota,
        }
    }

    fn key(&self, chunk: &ChunkRef) -> String {
        object_key(self.prefix.as_deref(), &chunk.id)
    }
}

fn object_key(prefix: Option<&str>, id: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{id}"),
        None => id.to_string(),
    }
}

fn parse_retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_DELAY)
}

/// Translate an SDK failure into the drive error taxonomy.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, chunk: &str) -> ErrorKind
where
    E: std::error::Error + Send + Sync + 'static,
{
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return ErrorKind::Network(DisplayErrorContext(&err).to_string());
    }
    let (status, retry_after) = match err.raw_response() {
        Some(response) => (Some(response.status().as_u16()), response.headers().get("retry-after")),
        None => (None, None),
    };
    match status {
        Some(429 | 503) => ErrorKind::RetryAfter(parse_retry_after(retry_after)),
        Some(401 | 403) => ErrorKind::PermissionDenied,
        Some(404) => ErrorKind::NotFound(chunk.to_string()),
        _ => ErrorKind::Backend(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl DriveProvider for S3Provider {
    #[instrument(level = "debug", skip(self, data, progress), fields(chunk = %chunk.id, size = data.len()))]
    async fn write_chunk(&self, chunk: &ChunkRef, data: &[u8], progress: &dyn Progress) -> Result<()> {
        if progress.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(chunk))
            .metadata(REVISION_KEY, chunk.revision.to_string())
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &chunk.id))?;
        progress.advance(data.len() as u64);
        Ok(())
    }

    #[instrument(level = "debug", skip(self, progress), fields(chunk = %chunk.id))]
    async fn read_chunk(&self, chunk: &ChunkRef, progress: &dyn Progress) -> Result<Vec<u8>> {
        if progress.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(chunk))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &chunk.id))?;
        let data = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("interrupted download of chunk {}", chunk.id)))?
            .into_bytes()
            .to_vec();
        progress.advance(data.len() as u64);
        Ok(data)
    }

    async fn remove_chunk(&self, chunk: &ChunkRef) -> Result<()> {
        // DeleteObject succeeds for keys that don't exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(chunk))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &chunk.id))?;
        Ok(())
    }

    async fn is_chunk_stale(&self, chunk: &ChunkRef) -> Result<i64> {
        let head = self.client.head_object().bucket(&self.bucket).key(self.key(chunk)).send().await;
        let output = match head {
            Ok(output) => output,
            Err(e) => match map_sdk_error(e, &chunk.id) {
                ErrorKind::NotFound(_) => return Ok(missing_revision(chunk)),
                other => exn::bail!(other),
            },
        };
        let remote = output
            .metadata()
            .and_then(|metadata| metadata.get(REVISION_KEY))
            .and_then(|revision| revision.parse::<i64>().ok());
        Ok(match remote {
            Some(remote) => chunk.revision - remote,
            // Object written by something else; treat as stale.
            None => missing_revision(chunk),
        })
    }

    fn max_quota(&self) -> u64 {
        self.max_quota
    }

    #[instrument(level = "debug", skip(self), fields(bucket = %self.bucket))]
    async fn initialize(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.bucket))?;
        Ok(())
    }
}
