//! Observable state of one transfer.

use crate::error::{ErrorKind, Result};
use cirrus_drive::Progress;
use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    #[display("upload")]
    Upload,
    #[display("download")]
    Download,
}

/// Lifecycle of a transfer.
///
/// `Ready → Running → {Completed | Error | Canceled}`. A running transfer
/// can be `Paused`; resuming sets `Resume`, which the task turns back into
/// `Running` at its next chunk boundary.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    #[display("ready")]
    Ready,
    #[display("running")]
    Running,
    #[display("paused")]
    Paused,
    #[display("resume")]
    Resume,
    #[display("completed")]
    Completed,
    #[display("error")]
    Error,
    #[display("canceled")]
    Canceled,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }
}

/// Shared handle on a transfer: the task updates it, callers observe and
/// steer it.
#[derive(Debug)]
pub struct TransferInfo {
    name: String,
    kind: TransferKind,
    node_id: String,
    size: AtomicU64,
    progress: AtomicU64,
    speed: AtomicU64,
    last_progress: AtomicU64,
    status: watch::Sender<TransferStatus>,
}

impl TransferInfo {
    pub fn new(name: impl Into<String>, kind: TransferKind, node_id: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            node_id: node_id.into(),
            size: AtomicU64::new(size),
            progress: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            last_progress: AtomicU64::new(0),
            status: watch::Sender::new(TransferStatus::Ready),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// The node being uploaded to or downloaded from.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    /// Bytes moved to or from drives so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Bytes per second over the last sweep interval.
    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    /// Wait until the transfer reaches a terminal status.
    pub async fn wait(&self) -> TransferStatus {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        match rx.wait_for(TransferStatus::is_terminal).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Apply `f` to the status; returns whether it changed.
    fn transition(&self, f: impl FnOnce(TransferStatus) -> Option<TransferStatus>) -> bool {
        self.status.send_if_modified(|status| match f(*status) {
            Some(next) if next != *status => {
                *status = next;
                true
            },
            _ => false,
        })
    }

    /// `Running | Resume → Paused`.
    pub fn pause(&self) -> bool {
        self.transition(|status| match status {
            TransferStatus::Running | TransferStatus::Resume => Some(TransferStatus::Paused),
            _ => None,
        })
    }

    /// `Paused → Resume`.
    pub fn resume(&self) -> bool {
        self.transition(|status| (status == TransferStatus::Paused).then_some(TransferStatus::Resume))
    }

    /// Any non-terminal status `→ Canceled`. Takes effect at the next chunk
    /// boundary of a running transfer.
    pub fn cancel(&self) -> bool {
        self.transition(|status| (!status.is_terminal()).then_some(TransferStatus::Canceled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TransferStatus::Canceled
    }

    pub(crate) fn start(&self) -> bool {
        self.transition(|status| (status == TransferStatus::Ready).then_some(TransferStatus::Running))
    }

    /// Move to a terminal status unless one was already reached.
    pub(crate) fn finish(&self, outcome: TransferStatus) -> bool {
        self.transition(|status| (!status.is_terminal()).then_some(outcome))
    }

    /// Called between chunks. Sleeps while paused, acknowledges a resume and
    /// reports a cancellation as [`ErrorKind::Cancelled`].
    pub(crate) async fn checkpoint(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|status| *status != TransferStatus::Paused).await {
            Ok(status) => *status,
            Err(_) => TransferStatus::Canceled,
        };
        match status {
            TransferStatus::Canceled => exn::bail!(ErrorKind::Cancelled),
            TransferStatus::Resume => {
                self.transition(|status| (status == TransferStatus::Resume).then_some(TransferStatus::Running));
                Ok(())
            },
            _ => Ok(()),
        }
    }

    /// Recompute [`speed`](Self::speed) from the progress made since the
    /// previous call, `elapsed` ago.
    pub(crate) fn update_speed(&self, elapsed: Duration) {
        let progress = self.progress();
        let last = self.last_progress.swap(progress, Ordering::Relaxed);
        let millis = elapsed.as_millis().max(1) as u64;
        self.speed.store(progress.saturating_sub(last).saturating_mul(1000) / millis, Ordering::Relaxed);
    }
}

impl Progress for TransferInfo {
    fn is_cancelled(&self) -> bool {
        TransferInfo::is_cancelled(self)
    }

    fn advance(&self, bytes: u64) {
        self.progress.fetch_add(bytes, Ordering::Relaxed);
    }
}
