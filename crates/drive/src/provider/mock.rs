//! In-memory drive for testing.

use crate::error::{ErrorKind, Result};
use crate::provider::{ChunkRef, DriveProvider, Progress, missing_revision};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Failure injected into the next chunk operation.
#[derive(Debug, Clone, Copy)]
enum Fault {
    RetryAfter(Duration),
    Fatal,
}

/// In-memory drive for testing.
///
/// Chunks live in a `HashMap` behind a [`RwLock`]. Failures can be scripted
/// per call so transfer retry/failure paths can be exercised without a
/// network.
///
/// # Examples
///
/// ```
/// use cirrus_drive::{ChunkRef, DriveProvider, MockProvider, NoProgress};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = MockProvider::default().with_max_quota(1024);
/// provider.retry_next(1, Duration::from_millis(1));
///
/// let chunk = ChunkRef::new("c1", 1);
/// assert!(provider.write_chunk(&chunk, b"data", &NoProgress).await.is_err());
/// provider.write_chunk(&chunk, b"data", &NoProgress).await?;
/// assert_eq!(provider.stored("c1").await.as_deref(), Some(&b"data"[..]));
/// # Ok(())
/// # }
/// ```
pub struct MockProvider {
    chunks: RwLock<HashMap<String, (i64, Vec<u8>)>>,
    faults: Mutex<VecDeque<Fault>>,
    fail_initialize: Option<InitFailure>,
    max_quota: u64,
    latency: Duration,
    writes: AtomicUsize,
    reads: AtomicUsize,
    removes: AtomicUsize,
}

/// `ErrorKind` isn't `Clone` (it can hold an `io::Error`), so initialization
/// failures are described by the subset that matters for drive status.
#[derive(Debug, Clone, Copy)]
enum InitFailure {
    PermissionDenied,
    Expired,
    Unreachable,
}

impl MockProvider {
    /// Create a mock drive pre-populated with chunks (id, revision, bytes).
    pub fn with_chunks(chunks: impl IntoIterator<Item = (impl Into<String>, i64, impl Into<Vec<u8>>)>) -> Self {
        let map = chunks.into_iter().map(|(id, revision, data)| (id.into(), (revision, data.into()))).collect();
        Self {
            chunks: RwLock::new(map),
            faults: Mutex::new(VecDeque::new()),
            fail_initialize: None,
            max_quota: crate::MAX_DRIVE_QUOTA,
            latency: Duration::ZERO,
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    pub fn with_max_quota(mut self, max_quota: u64) -> Self {
        self.max_quota = max_quota;
        self
    }

    /// Delay every chunk operation, so tests can act while a transfer is in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make [`initialize`](DriveProvider::initialize) fail with a login error.
    pub fn with_login_failure(mut self) -> Self {
        self.fail_initialize = Some(InitFailure::PermissionDenied);
        self
    }

    pub fn with_expired_credentials(mut self) -> Self {
        self.fail_initialize = Some(InitFailure::Expired);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.fail_initialize = Some(InitFailure::Unreachable);
        self
    }

    /// The next `count` chunk operations answer with `RetryAfter(delay)`.
    pub fn retry_next(&self, count: usize, delay: Duration) {
        self.push_faults(count, Fault::RetryAfter(delay));
    }

    /// The next `count` chunk operations fail fatally.
    pub fn fail_next(&self, count: usize) {
        self.push_faults(count, Fault::Fatal);
    }

    fn push_faults(&self, count: usize, fault: Fault) {
        let mut faults = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        faults.extend(std::iter::repeat_n(fault, count));
    }

    pub async fn stored(&self, id: &str) -> Option<Vec<u8>> {
        self.chunks.read().await.get(id).map(|(_, data)| data.clone())
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of successful `write_chunk` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    async fn next_fault(&self) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fault = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).pop_front();
        match fault {
            None => Ok(()),
            Some(Fault::RetryAfter(delay)) => exn::bail!(ErrorKind::RetryAfter(delay)),
            Some(Fault::Fatal) => exn::bail!(ErrorKind::Backend("injected failure".to_string())),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        let chunks: [(&str, i64, Vec<u8>); 0] = [];
        Self::with_chunks(chunks)
    }
}

#[async_trait]
impl DriveProvider for MockProvider {
    async fn write_chunk(&self, chunk: &ChunkRef, data: &[u8], progress: &dyn Progress) -> Result<()> {
        self.next_fault().await?;
        if progress.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        self.chunks.write().await.insert(chunk.id.clone(), (chunk.revision, data.to_vec()));
        progress.advance(data.len() as u64);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_chunk(&self, chunk: &ChunkRef, progress: &dyn Progress) -> Result<Vec<u8>> {
        self.next_fault().await?;
        let data = self
            .chunks
            .read()
            .await
            .get(&chunk.id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| ErrorKind::NotFound(chunk.id.clone()))?;
        progress.advance(data.len() as u64);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn remove_chunk(&self, chunk: &ChunkRef) -> Result<()> {
        self.next_fault().await?;
        self.chunks.write().await.remove(&chunk.id);
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_chunk_stale(&self, chunk: &ChunkRef) -> Result<i64> {
        Ok(match self.chunks.read().await.get(&chunk.id) {
            Some((revision, _)) => chunk.revision - revision,
            None => missing_revision(chunk),
        })
    }

    fn max_quota(&self) -> u64 {
        self.max_quota
    }

    async fn initialize(&self) -> Result<()> {
        match self.fail_initialize {
            None => Ok(()),
            Some(InitFailure::PermissionDenied) => exn::bail!(ErrorKind::PermissionDenied),
            Some(InitFailure::Expired) => exn::bail!(ErrorKind::CredentialsExpired),
            Some(InitFailure::Unreachable) => exn::bail!(ErrorKind::Network("mock unreachable".to_string())),
        }
    }
}
