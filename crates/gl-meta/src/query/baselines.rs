//! Anomaly baseline rows.

use crate::error::{MetaError, MetaResult};
use crate::row_helpers::format_ts;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use gl_core::{AnomalyBaseline, MetricKind};

/// The most recent `window` values per metric, oldest first.
pub fn load(conn: &Connection, table: &str, window: usize) -> MetaResult<AnomalyBaseline> {
    let mut stmt = conn.prepare(
        "SELECT metric, value FROM (
             SELECT metric, value, seq,
                    row_number() OVER (PARTITION BY metric ORDER BY seq DESC) AS rn
             FROM gl_meta.baselines
             WHERE target_table = ?
         ) AS recent
         WHERE rn <= ?
         ORDER BY metric, seq",
    )?;
    let limit = i64::try_from(window).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(duckdb::params![table, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut baseline = AnomalyBaseline::new();
    for (metric, value) in rows {
        match metric.parse::<MetricKind>() {
            Ok(kind) => baseline.push(kind, value, window),
            Err(_) => log::warn!("Ignoring unknown baseline metric '{metric}' for {table}"),
        }
    }
    Ok(baseline)
}

/// Append one value per metric for an accepted run.
pub fn append(
    conn: &Connection,
    table: &str,
    run_id: &str,
    values: &[(MetricKind, f64)],
    now: DateTime<Utc>,
) -> MetaResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO gl_meta.baselines (target_table, metric, value, run_id, recorded_at)
         VALUES (?, ?, ?, ?, CAST(? AS TIMESTAMP))",
    )?;
    let ts = format_ts(now);
    for (metric, value) in values {
        if !value.is_finite() {
            return Err(MetaError::QueryError(format!(
                "refusing non-finite {metric} baseline value for {table}"
            )));
        }
        stmt.execute(duckdb::params![table, metric.as_str(), value, run_id, ts])?;
    }
    Ok(())
}
