//! Conversions between stored columns and state types.

use crate::error::{MetaError, MetaResult};
use chrono::{DateTime, NaiveDateTime, Utc};

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Render a timestamp for `CAST(? AS TIMESTAMP)`.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(TIMESTAMP_FORMAT).to_string()
}

/// Parse `CAST(ts AS VARCHAR)` output back into UTC.
pub(crate) fn parse_ts(table: &str, raw: &str) -> MetaResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| MetaError::CorruptState {
            table: table.to_string(),
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

/// Stored batch ids are BIGINT.
pub(crate) fn to_db_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_id(id: i64) -> u64 {
    u64::try_from(id).unwrap_or(0)
}
