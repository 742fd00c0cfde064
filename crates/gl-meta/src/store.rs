//! Store interfaces used by the merge engine, implemented by [`MetaDb`].
//!
//! Reads never mutate; every mutation of merge state for an accepted run
//! goes through [`StateStore::commit_state`] so the key index, the
//! watermark and the baselines move together or not at all.

use crate::connection::MetaDb;
use crate::error::{MetaError, MetaResult};
use crate::query::runs::RunRecord;
use crate::query::{baselines, key_index, runs, watermarks};
use chrono::Utc;
use gl_core::{
    AnomalyBaseline, BusinessKey, KeyEntry, MetricKind, SourceName, TableName, Watermark,
    WatermarkValue,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// High-water marks per (source, target table)
pub trait WatermarkStore: Send + Sync {
    fn get_watermark(&self, source: &SourceName, table: &TableName)
        -> MetaResult<Option<Watermark>>;

    /// Move the watermark forward; fails on value or batch-id regression.
    fn advance_watermark(
        &self,
        source: &SourceName,
        table: &TableName,
        value: &WatermarkValue,
        batch_id: u64,
    ) -> MetaResult<Watermark>;

    /// Full-refresh bypass: back to `beginning`, with an audit row.
    fn reset_watermark(&self, source: &SourceName, table: &TableName, reason: &str)
        -> MetaResult<()>;

    fn list_watermarks(&self) -> MetaResult<Vec<Watermark>>;
}

/// Known business keys per target table
pub trait KeyIndexStore: Send + Sync {
    fn lookup_keys(
        &self,
        table: &TableName,
        keys: &[&BusinessKey],
    ) -> MetaResult<HashMap<BusinessKey, KeyEntry>>;

    fn key_entries(&self, table: &TableName, live_only: bool) -> MetaResult<Vec<KeyEntry>>;

    fn live_key_count(&self, table: &TableName) -> MetaResult<usize>;

    /// The subset of `keys` that are live in `table`.
    fn live_keys_among(
        &self,
        table: &TableName,
        keys: &[&BusinessKey],
    ) -> MetaResult<HashSet<BusinessKey>> {
        Ok(self
            .lookup_keys(table, keys)?
            .into_values()
            .filter(KeyEntry::is_live)
            .map(|e| e.key)
            .collect())
    }
}

/// Rolling metric history of accepted runs
pub trait BaselineStore: Send + Sync {
    fn load_baseline(&self, table: &TableName, window: usize) -> MetaResult<AnomalyBaseline>;
}

/// Per-table run outcomes
pub trait RunHistoryStore: Send + Sync {
    fn record_run(&self, record: &RunRecord) -> MetaResult<()>;
    fn recent_runs(&self, limit: usize) -> MetaResult<Vec<RunRecord>>;
}

/// Everything committed for one accepted table run.
#[derive(Debug, Clone)]
pub struct StateCommit {
    pub source: SourceName,
    pub table: TableName,
    pub run_id: String,
    pub batch_id: u64,
    pub watermark: WatermarkValue,
    pub key_entries: Vec<KeyEntry>,
    /// Set on full refresh: reset (audited) before advancing
    pub reset_reason: Option<String>,
    pub baseline: Vec<(MetricKind, f64)>,
}

/// All merge state, committed atomically
pub trait StateStore: WatermarkStore + KeyIndexStore + BaselineStore + RunHistoryStore {
    /// Key index, then watermark, then baselines, in one transaction.
    fn commit_state(&self, commit: &StateCommit) -> MetaResult<Watermark>;
}

/// Reject a watermark or batch id that would move backwards.
///
/// Equal values pass, so redelivered batches commit as no-ops.
pub fn check_advance(
    current: Option<&Watermark>,
    source: &SourceName,
    table: &TableName,
    value: &WatermarkValue,
    batch_id: u64,
) -> MetaResult<()> {
    let Some(current) = current else {
        return Ok(());
    };
    match value.partial_cmp(&current.high_water_value) {
        Some(Ordering::Less) | None => {
            return Err(MetaError::WatermarkRegression {
                source_name: source.to_string(),
                table: table.to_string(),
                current: current.high_water_value.to_string(),
                attempted: value.to_string(),
            })
        }
        _ => {}
    }
    if batch_id < current.last_batch_id {
        return Err(MetaError::BatchRegression {
            source_name: source.to_string(),
            table: table.to_string(),
            last: current.last_batch_id,
            attempted: batch_id,
        });
    }
    Ok(())
}

fn reset_by() -> String {
    std::env::var("USER").unwrap_or_else(|_| "grainline".to_string())
}

impl WatermarkStore for MetaDb {
    fn get_watermark(
        &self,
        source: &SourceName,
        table: &TableName,
    ) -> MetaResult<Option<Watermark>> {
        self.with_conn(|conn| watermarks::get(conn, source, table))
    }

    fn advance_watermark(
        &self,
        source: &SourceName,
        table: &TableName,
        value: &WatermarkValue,
        batch_id: u64,
    ) -> MetaResult<Watermark> {
        self.transaction(|conn| {
            let current = watermarks::get(conn, source, table)?;
            check_advance(current.as_ref(), source, table, value, batch_id)?;
            let now = Utc::now();
            watermarks::upsert(conn, source, table, value, batch_id, now)?;
            Ok(Watermark {
                source: source.clone(),
                table: table.clone(),
                high_water_value: value.clone(),
                last_batch_id: batch_id,
                updated_at: now,
            })
        })
    }

    fn reset_watermark(
        &self,
        source: &SourceName,
        table: &TableName,
        reason: &str,
    ) -> MetaResult<()> {
        self.transaction(|conn| {
            let current = watermarks::get(conn, source, table)?;
            let now = Utc::now();
            watermarks::record_reset(conn, source, table, current.as_ref(), reason, &reset_by(), now)?;
            watermarks::upsert(conn, source, table, &WatermarkValue::Beginning, 0, now)
        })?;
        log::info!("Watermark for {source} -> {table} reset to beginning ({reason})");
        Ok(())
    }

    fn list_watermarks(&self) -> MetaResult<Vec<Watermark>> {
        self.with_conn(watermarks::list)
    }
}

impl KeyIndexStore for MetaDb {
    fn lookup_keys(
        &self,
        table: &TableName,
        keys: &[&BusinessKey],
    ) -> MetaResult<HashMap<BusinessKey, KeyEntry>> {
        self.with_conn(|conn| key_index::lookup(conn, table, keys))
    }

    fn key_entries(&self, table: &TableName, live_only: bool) -> MetaResult<Vec<KeyEntry>> {
        self.with_conn(|conn| key_index::entries(conn, table, live_only))
    }

    fn live_key_count(&self, table: &TableName) -> MetaResult<usize> {
        self.with_conn(|conn| key_index::live_count(conn, table))
    }
}

impl BaselineStore for MetaDb {
    fn load_baseline(&self, table: &TableName, window: usize) -> MetaResult<AnomalyBaseline> {
        self.with_conn(|conn| baselines::load(conn, table, window))
    }
}

impl RunHistoryStore for MetaDb {
    fn record_run(&self, record: &RunRecord) -> MetaResult<()> {
        self.with_conn(|conn| runs::insert(conn, record))
    }

    fn recent_runs(&self, limit: usize) -> MetaResult<Vec<RunRecord>> {
        self.with_conn(|conn| runs::recent(conn, limit))
    }
}

impl StateStore for MetaDb {
    fn commit_state(&self, commit: &StateCommit) -> MetaResult<Watermark> {
        let source = &commit.source;
        let table = &commit.table;
        self.transaction(|conn| {
            let now = Utc::now();
            let mut current = watermarks::get(conn, source, table)?;
            if let Some(reason) = &commit.reset_reason {
                watermarks::record_reset(conn, source, table, current.as_ref(), reason, &reset_by(), now)?;
                current = None;
            }
            check_advance(current.as_ref(), source, table, &commit.watermark, commit.batch_id)?;

            let written = key_index::upsert(conn, table, &commit.key_entries, now)?;
            watermarks::upsert(conn, source, table, &commit.watermark, commit.batch_id, now)?;
            baselines::append(conn, table, &commit.run_id, &commit.baseline, now)?;
            log::debug!(
                "Committed state for {table}: {written} key entries, watermark {} at batch {}",
                commit.watermark,
                commit.batch_id
            );
            Ok(Watermark {
                source: source.clone(),
                table: table.clone(),
                high_water_value: commit.watermark.clone(),
                last_batch_id: commit.batch_id,
                updated_at: now,
            })
        })
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
