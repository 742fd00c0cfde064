//! Watermark rows and the reset audit trail.

use crate::error::{MetaError, MetaResult};
use crate::row_helpers::{format_ts, from_db_id, parse_ts, to_db_id};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use gl_core::{SourceName, TableName, Watermark, WatermarkValue};

const TABLE: &str = "gl_meta.watermarks";

fn encode(value: &WatermarkValue) -> MetaResult<String> {
    serde_json::to_string(value).map_err(|e| MetaError::CorruptState {
        table: TABLE.into(),
        message: e.to_string(),
    })
}

fn decode(raw: &str) -> MetaResult<WatermarkValue> {
    serde_json::from_str(raw).map_err(|e| MetaError::CorruptState {
        table: TABLE.into(),
        message: format!("bad watermark '{raw}': {e}"),
    })
}

fn build(
    source: String,
    table: String,
    value: String,
    batch_id: i64,
    updated_at: String,
) -> MetaResult<Watermark> {
    let corrupt = |what: &str| MetaError::CorruptState {
        table: TABLE.into(),
        message: format!("empty {what}"),
    };
    Ok(Watermark {
        source: SourceName::try_new(source).ok_or_else(|| corrupt("source"))?,
        table: TableName::try_new(table).ok_or_else(|| corrupt("target_table"))?,
        high_water_value: decode(&value)?,
        last_batch_id: from_db_id(batch_id),
        updated_at: parse_ts(TABLE, &updated_at)?,
    })
}

/// Current watermark, `None` if the pair never committed.
pub fn get(conn: &Connection, source: &str, table: &str) -> MetaResult<Option<Watermark>> {
    let row = conn.query_row(
        "SELECT source, target_table, high_water_value, last_batch_id, CAST(updated_at AS VARCHAR)
         FROM gl_meta.watermarks WHERE source = ? AND target_table = ?",
        duckdb::params![source, table],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    );
    match row {
        Ok((s, t, v, b, u)) => build(s, t, v, b, u).map(Some),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MetaError::QueryError(format!("read watermark: {e}"))),
    }
}

/// Every stored watermark, ordered by table then source.
pub fn list(conn: &Connection) -> MetaResult<Vec<Watermark>> {
    let mut stmt = conn.prepare(
        "SELECT source, target_table, high_water_value, last_batch_id, CAST(updated_at AS VARCHAR)
         FROM gl_meta.watermarks ORDER BY target_table, source",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(s, t, v, b, u)| build(s, t, v, b, u))
        .collect()
}

/// Insert or overwrite the watermark row. No regression check.
pub fn upsert(
    conn: &Connection,
    source: &str,
    table: &str,
    value: &WatermarkValue,
    batch_id: u64,
    now: DateTime<Utc>,
) -> MetaResult<()> {
    conn.execute(
        "INSERT INTO gl_meta.watermarks
             (source, target_table, high_water_value, last_batch_id, updated_at)
         VALUES (?, ?, ?, ?, CAST(? AS TIMESTAMP))
         ON CONFLICT (source, target_table) DO UPDATE SET
             high_water_value = excluded.high_water_value,
             last_batch_id = excluded.last_batch_id,
             updated_at = excluded.updated_at",
        duckdb::params![source, table, encode(value)?, to_db_id(batch_id), format_ts(now)],
    )
    .map_err(|e| MetaError::QueryError(format!("write watermark: {e}")))?;
    Ok(())
}

/// Append an audit row for a full-refresh reset.
pub fn record_reset(
    conn: &Connection,
    source: &str,
    table: &str,
    previous: Option<&Watermark>,
    reason: &str,
    reset_by: &str,
    now: DateTime<Utc>,
) -> MetaResult<()> {
    let previous_value = previous
        .map(|w| encode(&w.high_water_value))
        .transpose()?;
    let previous_batch = previous.map(|w| to_db_id(w.last_batch_id));
    conn.execute(
        "INSERT INTO gl_meta.watermark_resets
             (source, target_table, previous_value, previous_batch_id, reason, reset_by, reset_at)
         VALUES (?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP))",
        duckdb::params![
            source,
            table,
            previous_value,
            previous_batch,
            reason,
            reset_by,
            format_ts(now)
        ],
    )
    .map_err(|e| MetaError::QueryError(format!("record watermark reset: {e}")))?;
    Ok(())
}

/// Number of recorded resets for a pair.
pub fn reset_count(conn: &Connection, source: &str, table: &str) -> MetaResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM gl_meta.watermark_resets WHERE source = ? AND target_table = ?",
        duckdb::params![source, table],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or(0))
}
