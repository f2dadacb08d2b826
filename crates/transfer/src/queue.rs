//! Admission-controlled transfer queue.

use crate::error::{ErrorKind, Result};
use crate::info::{TransferInfo, TransferKind, TransferStatus};
use crate::task::{Job, run};
use crate::{download, upload};
use cirrus_fs::Storage;
use exn::ResultExt;
use futures::FutureExt;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;

pub const DEFAULT_PARALLEL_TRANSFERS: usize = 4;

/// Whether the network is up, as reported by the host.
///
/// Losing connectivity only stops admissions; running transfers carry on
/// and surface whatever the drives report.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

struct Active {
    info: Arc<TransferInfo>,
    handle: JoinHandle<()>,
}

struct Pending {
    info: Arc<TransferInfo>,
    job: Job,
}

struct Inner {
    parallel: usize,
    running: Vec<Active>,
    pending: VecDeque<Pending>,
    finished: Vec<Arc<TransferInfo>>,
    last_sweep: Instant,
    closed: bool,
}

impl Inner {
    fn has_capacity(&self, connectivity: &Connectivity) -> bool {
        !self.closed && self.running.len() < self.parallel && connectivity.is_connected()
    }

    fn spawn(&mut self, info: Arc<TransferInfo>, job: Job) {
        tracing::debug!(transfer = %info.name(), kind = %info.kind(), "transfer admitted");
        let handle = tokio::spawn(run(Arc::clone(&info), job));
        self.running.push(Active { info, handle });
    }

    /// Move tasks that have ended out of the running set.
    fn reap(&mut self) {
        let (done, running): (Vec<Active>, Vec<Active>) =
            std::mem::take(&mut self.running).into_iter().partition(|active| active.handle.is_finished());
        self.running = running;
        for Active { info, .. } in done {
            retire(&info);
            self.finished.push(info);
        }
    }

    /// Start pending tasks in FIFO order while capacity allows. Entries
    /// cancelled while waiting are retired without running.
    fn promote(&mut self, connectivity: &Connectivity) {
        while self.has_capacity(connectivity) {
            let Some(Pending { info, job }) = self.pending.pop_front() else {
                break;
            };
            if info.status().is_terminal() {
                self.finished.push(info);
                continue;
            }
            self.spawn(info, job);
        }
    }

    fn drain_pending(&mut self) {
        for Pending { info, .. } in self.pending.drain(..) {
            info.cancel();
            self.finished.push(info);
        }
    }
}

/// A task that ended without recording an outcome panicked or was aborted.
fn retire(info: &TransferInfo) {
    if info.finish(TransferStatus::Error) {
        tracing::warn!(transfer = %info.name(), "transfer task ended without a status");
    }
}

/// Runs at most `parallel` transfers at a time; the rest wait in FIFO
/// order until [`sweep`](Self::sweep) admits them.
pub struct TransferQueue {
    storage: Arc<Storage>,
    connectivity: Connectivity,
    inner: Mutex<Inner>,
}

impl TransferQueue {
    pub fn new(storage: Arc<Storage>, connectivity: Connectivity, parallel: usize) -> Self {
        let inner = Inner {
            parallel: parallel.max(1),
            running: Vec::new(),
            pending: VecDeque::new(),
            finished: Vec::new(),
            last_sweep: Instant::now(),
            closed: false,
        };
        Self { storage, connectivity, inner: Mutex::new(inner) }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Upload a local file into an existing file node.
    pub async fn enqueue_upload(&self, node_id: &str, source: impl Into<PathBuf>) -> Result<Arc<TransferInfo>> {
        let node = self.storage.node(node_id).await.or_raise(|| ErrorKind::Storage)?;
        let info = Arc::new(TransferInfo::new(node.name, TransferKind::Upload, node.id, 0));
        let job = upload::upload(Arc::clone(&self.storage), Arc::clone(&info), source.into()).boxed();
        self.submit(info, job).await
    }

    /// Download a file node into a local file.
    pub async fn enqueue_download(&self, node_id: &str, destination: impl Into<PathBuf>) -> Result<Arc<TransferInfo>> {
        let node = self.storage.node(node_id).await.or_raise(|| ErrorKind::Storage)?;
        let info = Arc::new(TransferInfo::new(node.name, TransferKind::Download, node.id, node.size));
        let job = download::download(Arc::clone(&self.storage), Arc::clone(&info), destination.into()).boxed();
        self.submit(info, job).await
    }

    async fn submit(&self, info: Arc<TransferInfo>, job: Job) -> Result<Arc<TransferInfo>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            exn::bail!(ErrorKind::Closed);
        }
        inner.reap();
        if inner.pending.is_empty() && inner.has_capacity(&self.connectivity) {
            inner.spawn(Arc::clone(&info), job);
        } else {
            tracing::debug!(transfer = %info.name(), pending = inner.pending.len() + 1, "transfer queued");
            inner.pending.push_back(Pending { info: Arc::clone(&info), job });
        }
        Ok(info)
    }

    /// Periodic housekeeping: retire finished tasks, admit pending ones and
    /// recompute speeds.
    #[instrument(level = "trace", skip(self))]
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        inner.reap();
        inner.promote(&self.connectivity);
        let now = Instant::now();
        let elapsed = now - inner.last_sweep;
        inner.last_sweep = now;
        for active in &inner.running {
            active.info.update_speed(elapsed);
        }
    }

    /// Every transfer the queue knows about: running, then pending, then
    /// finished.
    pub async fn transfers(&self) -> Vec<Arc<TransferInfo>> {
        let inner = self.inner.lock().await;
        let running = inner.running.iter().map(|active| &active.info);
        let pending = inner.pending.iter().map(|pending| &pending.info);
        running.chain(pending).chain(inner.finished.iter()).cloned().collect()
    }

    /// Forget finished transfers.
    pub async fn clear_finished(&self) {
        let mut inner = self.inner.lock().await;
        inner.reap();
        inner.finished.clear();
    }

    pub async fn active_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.reap();
        inner.running.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn parallel(&self) -> usize {
        self.inner.lock().await.parallel
    }

    /// Change the concurrency budget. Raising it admits pending transfers
    /// right away; lowering it lets running ones finish.
    pub async fn set_parallel(&self, parallel: usize) {
        let mut inner = self.inner.lock().await;
        inner.parallel = parallel.max(1);
        inner.reap();
        inner.promote(&self.connectivity);
    }

    /// Cancel every running and pending transfer.
    pub async fn cancel_all(&self) {
        let mut inner = self.inner.lock().await;
        for active in &inner.running {
            active.info.cancel();
        }
        inner.drain_pending();
        tracing::info!(running = inner.running.len(), "all transfers cancelled");
    }

    /// Stop admitting work, drop pending transfers and wait for running ones
    /// to end.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let running = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.drain_pending();
            std::mem::take(&mut inner.running)
        };
        let mut finished = Vec::with_capacity(running.len());
        for Active { info, handle } in running {
            if let Err(err) = handle.await {
                tracing::warn!(transfer = %info.name(), error = %err, "transfer task panicked");
            }
            retire(&info);
            finished.push(info);
        }
        self.inner.lock().await.finished.extend(finished);
    }
}
