//! Chunk transfers between the cirrus cache and its drives.
//!
//! An upload copies a local file into a node and pushes its chunks to their
//! drives; a download fetches the node's uncached chunks and writes the
//! logical stream to a local file. Both run as tokio tasks under a
//! [`TransferQueue`] that bounds concurrency and holds work back while the
//! network is down. Each task is observed and steered through its
//! [`TransferInfo`].

mod download;
pub mod error;
mod info;
mod queue;
mod task;
mod upload;

pub use crate::info::{TransferInfo, TransferKind, TransferStatus};
pub use crate::queue::{Connectivity, DEFAULT_PARALLEL_TRANSFERS, TransferQueue};
