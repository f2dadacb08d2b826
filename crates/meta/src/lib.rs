//! Metadata store for cirrus.
//!
//! Persists the three record types the storage engine keeps in memory:
//! - **Nodes** (`inodes` table): entries of the logical file tree.
//! - **Chunks** (`chunks` table): fixed-size extents of a node's byte
//!   stream, each placed on exactly one drive.
//! - **Drives** (`drives` table): configured drive providers and their
//!   quota/usage counters.
//!
//! The in-memory state is authoritative while the process runs. This crate
//! only offers "fetch everything" at startup and batched upserts/deletes for
//! the periodic flush, each batch running in a single transaction so that a
//! failed flush leaves the store untouched and can simply be retried.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{ChunkRecord, DriveRecord, NodeRecord};
pub use crate::repo::Repository;
