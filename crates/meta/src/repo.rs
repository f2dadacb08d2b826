//! Repository over the `inodes`, `chunks` and `drives` tables.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{ChunkRecord, ChunkRow, DriveRecord, DriveRow, NodeRecord, NodeRow};
use exn::ResultExt;
use sqlx::SqlitePool;
use tracing::instrument;

/// Fetch-all and batched write access to the metadata tables.
///
/// Every batch method runs inside a single transaction: either the whole
/// batch lands or nothing does. Upserts are keyed by primary key, so replaying
/// a batch after a failure is harmless.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> = sqlx::query_as(include_str!("../queries/fetch_nodes.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(NodeRecord::try_from).collect()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_chunks(&self) -> Result<Vec<ChunkRecord>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(include_str!("../queries/fetch_chunks.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(ChunkRecord::try_from).collect()
    }

    /// Drives are returned in the order they were first inserted.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_drives(&self) -> Result<Vec<DriveRecord>> {
        let rows: Vec<DriveRow> = sqlx::query_as(include_str!("../queries/fetch_drives.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(DriveRecord::try_from).collect()
    }

    // =========================================================================
    // Upsert
    // =========================================================================

    #[instrument(level = "debug", skip_all, fields(count = nodes.len()))]
    pub async fn upsert_nodes(&self, nodes: &[NodeRecord]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let rows = nodes.iter().map(NodeRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for row in rows {
            sqlx::query(include_str!("../queries/upsert_node.sql"))
                .bind(row.id)
                .bind(row.name)
                .bind(row.mime)
                .bind(row.size)
                .bind(row.ctime)
                .bind(row.atime)
                .bind(row.mtime)
                .bind(row.trashed)
                .bind(row.dtime)
                .bind(row.parent)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(count = chunks.len()))]
    pub async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let rows = chunks.iter().map(ChunkRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for row in rows {
            sqlx::query(include_str!("../queries/upsert_chunk.sql"))
                .bind(row.id)
                .bind(row.offset)
                .bind(row.inode)
                .bind(row.drive)
                .bind(row.revision)
                .bind(row.size)
                .bind(row.compressed)
                .bind(row.encrypted)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(count = drives.len()))]
    pub async fn upsert_drives(&self, drives: &[DriveRecord]) -> Result<()> {
        if drives.is_empty() {
            return Ok(());
        }
        let rows = drives.iter().map(DriveRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for row in rows {
            sqlx::query(include_str!("../queries/upsert_drive.sql"))
                .bind(row.id)
                .bind(row.service)
                .bind(row.description)
                .bind(row.quota)
                .bind(row.chunks)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub async fn delete_nodes(&self, ids: &[String]) -> Result<()> {
        self.delete_batch(include_str!("../queries/delete_node.sql"), ids).await
    }

    pub async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        self.delete_batch(include_str!("../queries/delete_chunk.sql"), ids).await
    }

    pub async fn delete_drives(&self, ids: &[String]) -> Result<()> {
        self.delete_batch(include_str!("../queries/delete_drive.sql"), ids).await
    }

    /// Deleting an id that is not stored is not an error.
    #[instrument(level = "debug", skip_all, fields(count = ids.len()))]
    async fn delete_batch(&self, query: &'static str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for id in ids {
            sqlx::query(query).bind(id).execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::UtcDateTime;

    async fn repo() -> Repository {
        let db = Database::connect_in_memory().await.unwrap();
        Repository::from(&db)
    }

    fn node(id: &str, name: &str, parent: &str) -> NodeRecord {
        let now = UtcDateTime::now().replace_nanosecond(0).unwrap();
        NodeRecord {
            id: id.to_string(),
            name: name.to_string(),
            mime: "application/octet-stream".to_string(),
            size: 0,
            created: now,
            accessed: now,
            modified: now,
            trashed: false,
            deleted_at: None,
            parent_id: parent.to_string(),
        }
    }

    fn chunk(id: &str, node: &str, offset: u64) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            offset,
            node_id: node.to_string(),
            drive_id: "drive-a".to_string(),
            revision: 1,
            size: 4,
            compressed: false,
            encrypted: false,
        }
    }

    fn drive(id: &str) -> DriveRecord {
        DriveRecord {
            id: id.to_string(),
            service: "offline-drive-service".to_string(),
            description: "Offline".to_string(),
            quota: 1 << 20,
            chunks: 0,
        }
    }

    #[tokio::test]
    async fn test_empty_store() {
        let repo = repo().await;
        assert!(repo.fetch_nodes().await.unwrap().is_empty());
        assert!(repo.fetch_chunks().await.unwrap().is_empty());
        assert!(repo.fetch_drives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = repo().await;
        let mut file = node("n1", "a.txt", "root");
        repo.upsert_nodes(&[file.clone()]).await.unwrap();
        repo.upsert_nodes(&[file.clone()]).await.unwrap();
        assert_eq!(repo.fetch_nodes().await.unwrap(), vec![file.clone()]);

        file.size = 8;
        file.trashed = true;
        file.deleted_at = Some(file.modified);
        repo.upsert_nodes(&[file.clone()]).await.unwrap();
        assert_eq!(repo.fetch_nodes().await.unwrap(), vec![file]);
    }

    #[tokio::test]
    async fn test_chunks_round_trip_in_offset_order() {
        let repo = repo().await;
        let chunks = vec![chunk("c2", "n1", 1), chunk("c1", "n1", 0)];
        repo.upsert_chunks(&chunks).await.unwrap();
        let fetched = repo.fetch_chunks().await.unwrap();
        assert_eq!(fetched.iter().map(|c| c.offset).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(fetched[0], chunks[1]);
    }

    #[tokio::test]
    async fn test_orphan_chunks_are_storable() {
        // The schema must accept chunks whose node/drive do not exist.
        let repo = repo().await;
        repo.upsert_chunks(&[chunk("c1", "missing-node", 0)]).await.unwrap();
        assert_eq!(repo.fetch_chunks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_batches() {
        let repo = repo().await;
        repo.upsert_nodes(&[node("n1", "a", "root"), node("n2", "b", "root")]).await.unwrap();
        repo.upsert_chunks(&[chunk("c1", "n1", 0)]).await.unwrap();
        repo.upsert_drives(&[drive("d1")]).await.unwrap();

        repo.delete_nodes(&["n1".to_string(), "unknown".to_string()]).await.unwrap();
        repo.delete_chunks(&["c1".to_string()]).await.unwrap();
        repo.delete_drives(&["d1".to_string()]).await.unwrap();

        let nodes = repo.fetch_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n2");
        assert!(repo.fetch_chunks().await.unwrap().is_empty());
        assert!(repo.fetch_drives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drives_keep_registration_order() {
        let repo = repo().await;
        repo.upsert_drives(&[drive("z"), drive("a")]).await.unwrap();
        let mut updated = drive("z");
        updated.chunks = 3;
        repo.upsert_drives(&[updated]).await.unwrap();
        let drives = repo.fetch_drives().await.unwrap();
        assert_eq!(drives.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["z", "a"]);
        assert_eq!(drives[0].chunks, 3);
    }

    #[tokio::test]
    async fn test_out_of_range_value_aborts_batch() {
        let repo = repo().await;
        let mut bad = node("n2", "huge", "root");
        bad.size = u64::MAX;
        let err = repo.upsert_nodes(&[node("n1", "ok", "root"), bad]).await.unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("node size"));
        assert!(repo.fetch_nodes().await.unwrap().is_empty());
    }
}
