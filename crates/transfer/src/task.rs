//! Plumbing shared by upload and download tasks.

use crate::error::{Error, ErrorKind, Result};
use crate::info::{TransferInfo, TransferStatus};
use cirrus_drive::error::{ErrorKind as DriveErrorKind, Result as DriveResult};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Local files are copied in and out of the logical stream in 4 MiB blocks.
pub(crate) const BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub(crate) type Job = BoxFuture<'static, Result<()>>;

/// Run a drive operation until it succeeds or fails for good.
///
/// `RetryAfter` is honoured without a cap; the loop only ends early when the
/// transfer gets cancelled while waiting.
pub(crate) async fn retry<T, F, Fut>(info: &TransferInfo, chunk_id: &str, mut op: F) -> DriveResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriveResult<T>>,
{
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(delay) = err.retry_after() else {
            return Err(err);
        };
        tracing::debug!(chunk = %chunk_id, delay_ms = delay.as_millis() as u64, "drive asked to retry");
        tokio::time::sleep(delay).await;
        if info.is_cancelled() {
            exn::bail!(DriveErrorKind::Cancelled);
        }
    }
}

pub(crate) fn drive_error(err: cirrus_drive::error::Error) -> Error {
    let kind = match &*err {
        DriveErrorKind::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::Drive,
    };
    err.raise(kind)
}

/// Drive a job to completion and record its outcome on `info`.
pub(crate) async fn run(info: Arc<TransferInfo>, job: Job) {
    let outcome = match job.await {
        Ok(()) => TransferStatus::Completed,
        Err(err) if *err == ErrorKind::Cancelled => TransferStatus::Canceled,
        Err(err) => {
            tracing::warn!(transfer = %info.name(), kind = %info.kind(), error = ?err, "transfer failed");
            TransferStatus::Error
        },
    };
    info.finish(outcome);
    tracing::info!(
        transfer = %info.name(),
        kind = %info.kind(),
        status = %info.status(),
        bytes = info.progress(),
        "transfer finished"
    );
}
