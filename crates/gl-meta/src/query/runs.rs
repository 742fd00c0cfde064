//! Run history rows.

use crate::error::MetaResult;
use crate::row_helpers::{format_ts, from_db_id, parse_ts, to_db_id};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use serde::Serialize;

/// Outcome of one table in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub layer: String,
    pub target_table: String,
    pub source: String,
    pub batch_id: Option<u64>,
    pub action: Option<String>,
    pub phase: String,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_quarantined: u64,
    pub warnings: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn insert(conn: &Connection, record: &RunRecord) -> MetaResult<()> {
    conn.execute(
        "INSERT INTO gl_meta.run_history
             (run_id, layer, target_table, source, batch_id, action, phase,
              rows_inserted, rows_updated, rows_deleted, rows_quarantined,
              warnings, error, started_at, finished_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                 CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
        duckdb::params![
            record.run_id,
            record.layer,
            record.target_table,
            record.source,
            record.batch_id.map(to_db_id),
            record.action,
            record.phase,
            to_db_id(record.rows_inserted),
            to_db_id(record.rows_updated),
            to_db_id(record.rows_deleted),
            to_db_id(record.rows_quarantined),
            i64::from(record.warnings),
            record.error,
            format_ts(record.started_at),
            format_ts(record.finished_at),
        ],
    )?;
    Ok(())
}

/// Most recent records first.
pub fn recent(conn: &Connection, limit: usize) -> MetaResult<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, layer, target_table, source, batch_id, action, phase,
                rows_inserted, rows_updated, rows_deleted, rows_quarantined,
                warnings, error,
                CAST(started_at AS VARCHAR), CAST(finished_at AS VARCHAR)
         FROM gl_meta.run_history
         ORDER BY finished_at DESC, target_table
         LIMIT ?",
    )?;
    let raw = stmt
        .query_map(duckdb::params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok((
                (
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ),
                (
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i32>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, String>(14)?,
                ),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(
            |(
                (run_id, layer, target_table, source, batch_id, action, phase),
                (inserted, updated, deleted, quarantined, warnings, error, started, finished),
            )| {
                Ok(RunRecord {
                    run_id,
                    layer,
                    target_table,
                    source,
                    batch_id: batch_id.map(from_db_id),
                    action,
                    phase,
                    rows_inserted: from_db_id(inserted),
                    rows_updated: from_db_id(updated),
                    rows_deleted: from_db_id(deleted),
                    rows_quarantined: from_db_id(quarantined),
                    warnings: u32::try_from(warnings).unwrap_or(0),
                    error,
                    started_at: parse_ts("gl_meta.run_history", &started)?,
                    finished_at: parse_ts("gl_meta.run_history", &finished)?,
                })
            },
        )
        .collect()
}
