use super::{from_sql_int, to_sql_int};
use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// Persisted form of a tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub created: UtcDateTime,
    pub accessed: UtcDateTime,
    pub modified: UtcDateTime,
    pub trashed: bool,
    pub deleted_at: Option<UtcDateTime>,
    pub parent_id: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct NodeRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) mime: String,
    pub(crate) size: i64,
    pub(crate) ctime: i64,
    pub(crate) atime: i64,
    pub(crate) mtime: i64,
    pub(crate) trashed: bool,
    pub(crate) dtime: Option<i64>,
    pub(crate) parent: String,
}

fn timestamp(seconds: i64) -> Result<UtcDateTime, Error> {
    UtcDateTime::from_unix_timestamp(seconds).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

impl TryFrom<&NodeRecord> for NodeRow {
    type Error = Error;
    fn try_from(node: &NodeRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: node.id.clone(),
            name: node.name.clone(),
            mime: node.mime.clone(),
            size: to_sql_int(node.size, "node size")?,
            ctime: node.created.unix_timestamp(),
            atime: node.accessed.unix_timestamp(),
            mtime: node.modified.unix_timestamp(),
            trashed: node.trashed,
            dtime: node.deleted_at.map(UtcDateTime::unix_timestamp),
            parent: node.parent_id.clone(),
        })
    }
}

impl TryFrom<NodeRow> for NodeRecord {
    type Error = Error;
    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            size: from_sql_int(row.size, "node size")?,
            created: timestamp(row.ctime)?,
            accessed: timestamp(row.atime)?,
            modified: timestamp(row.mtime)?,
            deleted_at: row.dtime.map(timestamp).transpose()?,
            trashed: row.trashed,
            id: row.id,
            name: row.name,
            mime: row.mime,
            parent_id: row.parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_record() {
        let now = UtcDateTime::now();
        let row = NodeRow {
            id: "b3c1".to_string(),
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 1024,
            ctime: now.unix_timestamp(),
            atime: now.unix_timestamp(),
            mtime: now.unix_timestamp(),
            trashed: false,
            dtime: None,
            parent: "root".to_string(),
        };
        let record = NodeRecord::try_from(row).unwrap();
        assert_eq!(record.size, 1024);
        assert_eq!(record.parent_id, "root");
        // Unix seconds drop the sub-second component.
        assert_eq!(record.modified, now.replace_nanosecond(0).unwrap());
    }

    #[test]
    fn test_negative_size_is_invalid() {
        let row = NodeRow {
            id: "b3c1".to_string(),
            name: "broken".to_string(),
            mime: "text/plain".to_string(),
            size: -1,
            ctime: 0,
            atime: 0,
            mtime: 0,
            trashed: false,
            dtime: None,
            parent: "root".to_string(),
        };
        let err = NodeRecord::try_from(row).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("node size"));
    }
}
