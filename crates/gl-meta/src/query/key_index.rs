//! Key index rows.

use crate::error::{MetaError, MetaResult};
use crate::row_helpers::{format_ts, from_db_id, to_db_id};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use gl_core::sql_utils::placeholders;
use gl_core::{BusinessKey, Fingerprint, KeyEntry};
use std::collections::HashMap;

/// Keys per `IN (...)` lookup statement.
const LOOKUP_CHUNK: usize = 500;

const COLUMNS: &str = "business_key, fingerprint, last_seen_batch_id, is_deleted, partition_value";

fn map_entry(row: &duckdb::Row<'_>) -> duckdb::Result<KeyEntry> {
    Ok(KeyEntry {
        key: BusinessKey::from_stored(row.get::<_, String>(0)?),
        fingerprint: Fingerprint::from_stored(row.get::<_, String>(1)?),
        last_seen_batch_id: from_db_id(row.get::<_, i64>(2)?),
        is_deleted: row.get(3)?,
        partition: row.get(4)?,
    })
}

/// Entries for the given keys; keys the index has never seen are absent.
pub fn lookup(
    conn: &Connection,
    table: &str,
    keys: &[&BusinessKey],
) -> MetaResult<HashMap<BusinessKey, KeyEntry>> {
    let mut found = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT {COLUMNS} FROM gl_meta.key_index
             WHERE target_table = ? AND business_key IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = std::iter::once(table).chain(chunk.iter().map(|k| k.as_str()));
        let entries = stmt
            .query_map(duckdb::params_from_iter(params), map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        for entry in entries {
            found.insert(entry.key.clone(), entry);
        }
    }
    Ok(found)
}

/// All entries of a table, optionally only live ones.
pub fn entries(conn: &Connection, table: &str, live_only: bool) -> MetaResult<Vec<KeyEntry>> {
    let filter = if live_only { " AND NOT is_deleted" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM gl_meta.key_index WHERE target_table = ?{filter} ORDER BY business_key"
    ))?;
    let entries = stmt
        .query_map(duckdb::params![table], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn live_count(conn: &Connection, table: &str) -> MetaResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM gl_meta.key_index WHERE target_table = ? AND NOT is_deleted",
        duckdb::params![table],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Insert or replace entries; returns the number written.
pub fn upsert(
    conn: &Connection,
    table: &str,
    entries: &[KeyEntry],
    now: DateTime<Utc>,
) -> MetaResult<usize> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO gl_meta.key_index
                 (target_table, business_key, fingerprint, last_seen_batch_id,
                  is_deleted, partition_value, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP))
             ON CONFLICT (target_table, business_key) DO UPDATE SET
                 fingerprint = excluded.fingerprint,
                 last_seen_batch_id = excluded.last_seen_batch_id,
                 is_deleted = excluded.is_deleted,
                 partition_value = excluded.partition_value,
                 updated_at = excluded.updated_at",
        )
        .map_err(|e| MetaError::QueryError(format!("prepare key index upsert: {e}")))?;
    let ts = format_ts(now);
    let mut written = 0;
    for entry in entries {
        written += stmt.execute(duckdb::params![
            table,
            entry.key.as_str(),
            entry.fingerprint.as_str(),
            to_db_id(entry.last_seen_batch_id),
            entry.is_deleted,
            entry.partition,
            ts
        ])?;
    }
    Ok(written)
}
