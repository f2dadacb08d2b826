use super::{from_sql_int, to_sql_int};
use crate::error::Error;

/// Persisted form of a drive provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveRecord {
    pub id: String,
    /// Service tag selecting the provider implementation.
    pub service: String,
    pub description: String,
    pub quota: u64,
    pub chunks: u64,
}

#[derive(sqlx::FromRow)]
pub(crate) struct DriveRow {
    pub(crate) id: String,
    pub(crate) service: String,
    pub(crate) description: String,
    pub(crate) quota: i64,
    pub(crate) chunks: i64,
}

impl TryFrom<&DriveRecord> for DriveRow {
    type Error = Error;
    fn try_from(drive: &DriveRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: drive.id.clone(),
            service: drive.service.clone(),
            description: drive.description.clone(),
            quota: to_sql_int(drive.quota, "drive quota")?,
            chunks: to_sql_int(drive.chunks, "drive chunk count")?,
        })
    }
}

impl TryFrom<DriveRow> for DriveRecord {
    type Error = Error;
    fn try_from(row: DriveRow) -> Result<Self, Self::Error> {
        Ok(Self {
            quota: from_sql_int(row.quota, "drive quota")?,
            chunks: from_sql_int(row.chunks, "drive chunk count")?,
            id: row.id,
            service: row.service,
            description: row.description,
        })
    }
}
