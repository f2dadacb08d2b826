mod chunk;
mod drive;
mod node;

pub use self::chunk::ChunkRecord;
pub(crate) use self::chunk::ChunkRow;
pub use self::drive::DriveRecord;
pub(crate) use self::drive::DriveRow;
pub use self::node::NodeRecord;
pub(crate) use self::node::NodeRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;

/// SQLite only has signed 64-bit integers.
pub(crate) fn to_sql_int(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn from_sql_int(value: i64, what: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}
