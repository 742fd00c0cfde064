//! MergeExecutor: apply a plan and commit state.
//!
//! A run for one table moves `Planned -> Committed | Quarantined | Aborted`.
//! Committing writes the target first, under the partition lock, then key
//! index, watermark and baselines in one state transaction. The regression
//! check runs under the lock before the physical write.

use crate::classify::{ClassCounts, KeyIndex, RowAction};
use crate::error::{MergeError, MergeResult};
use crate::lock::PartitionLocks;
use crate::plan::{MergeAction, MergePlan, MergeTarget};
use chrono::Utc;
use gl_check::{AnomalyVerdict, Violation};
use gl_core::{LockMode, PartitionSet, RecordBatch, SourceName, TableName, Value, WatermarkValue};
use gl_db::{Database, QuarantineRow, WriteSet};
use gl_meta::{check_advance, StateCommit, StateStore};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planned,
    Committed,
    Quarantined,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Planned => "planned",
            RunPhase::Committed => "committed",
            RunPhase::Quarantined => "quarantined",
            RunPhase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one table's merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub table: TableName,
    pub source: SourceName,
    pub batch_id: u64,
    pub action: MergeAction,
    pub phase: RunPhase,
    pub partitions: PartitionSet,
    pub counts: ClassCounts,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_deleted: usize,
    pub rows_quarantined: usize,
    pub rows_excluded: usize,
    /// High-water value after the run
    pub watermark: Option<WatermarkValue>,
    pub warnings: Vec<String>,
    pub violations: Vec<Violation>,
    pub anomaly: AnomalyVerdict,
    pub reason: Option<String>,
    pub duration_ms: u64,
}

impl MergeOutcome {
    /// Outcome of a plan that has not been executed.
    pub fn planned(target: &MergeTarget, plan: &MergePlan) -> Self {
        let inserted = count_action(plan, RowAction::Insert);
        Self {
            table: target.table.clone(),
            source: target.source.clone(),
            batch_id: plan.batch_id(),
            action: plan.action,
            phase: RunPhase::Planned,
            partitions: plan.partitions.clone(),
            counts: plan.counts,
            rows_inserted: inserted,
            rows_updated: plan.write_rows.len() - inserted,
            rows_deleted: plan.delete_rows.len(),
            rows_quarantined: 0,
            rows_excluded: plan.excluded_rows.len(),
            watermark: None,
            warnings: plan.warnings.clone(),
            violations: plan.grain.violations.clone(),
            anomaly: plan.anomaly.clone(),
            reason: plan.reason.clone(),
            duration_ms: 0,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.rows_inserted + self.rows_updated + self.rows_deleted
    }
}

fn count_action(plan: &MergePlan, action: RowAction) -> usize {
    plan.classified
        .rows
        .iter()
        .filter(|r| r.action == action && plan.write_rows.contains(&r.index))
        .count()
}

/// Applies merge plans against a target database and a state store.
pub struct MergeExecutor {
    db: Arc<dyn Database>,
    state: Arc<dyn StateStore>,
    locks: Arc<PartitionLocks>,
    lock_mode: LockMode,
}

impl MergeExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        state: Arc<dyn StateStore>,
        locks: Arc<PartitionLocks>,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            db,
            state,
            locks,
            lock_mode,
        }
    }

    pub async fn execute(
        &self,
        target: &MergeTarget,
        plan: MergePlan,
        key_index: &KeyIndex<'_>,
        run_id: &str,
    ) -> MergeResult<MergeOutcome> {
        let start = Instant::now();
        let mut outcome = match plan.action {
            MergeAction::Proceed | MergeAction::ProceedWithWarning => {
                self.commit(target, &plan, key_index, run_id).await?
            }
            MergeAction::Quarantine => self.quarantine(target, &plan, run_id).await?,
            MergeAction::Abort => {
                let mut outcome = MergeOutcome::planned(target, &plan);
                outcome.phase = RunPhase::Aborted;
                outcome.rows_inserted = 0;
                outcome.rows_updated = 0;
                outcome.rows_deleted = 0;
                outcome.watermark = self
                    .state
                    .get_watermark(&target.source, &target.table)?
                    .map(|w| w.high_water_value);
                log::warn!(
                    "{}: batch {} aborted: {}",
                    target.table,
                    outcome.batch_id,
                    outcome.reason.as_deref().unwrap_or("grain violations")
                );
                outcome
            }
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn commit(
        &self,
        target: &MergeTarget,
        plan: &MergePlan,
        key_index: &KeyIndex<'_>,
        run_id: &str,
    ) -> MergeResult<MergeOutcome> {
        let _guard = self
            .locks
            .acquire(&target.table, plan.partitions.clone(), self.lock_mode)
            .await?;

        let batch_id = plan.batch_id();
        let full_refresh = plan.full_refresh();
        let current = self.state.get_watermark(&target.source, &target.table)?;
        let base = match (&current, full_refresh) {
            (Some(wm), false) => wm.high_water_value.clone(),
            _ => WatermarkValue::Beginning,
        };
        let watermark = batch_high_water(&plan.classified.batch, &target.watermark_column, base)?;
        let previous = if full_refresh { None } else { current.as_ref() };
        check_advance(
            previous,
            &target.source,
            &target.table,
            &watermark,
            batch_id,
        )?;

        let writes = self.write_set(target, plan);
        let failure = |e: gl_db::DbError| MergeError::WriteFailure {
            table: target.table.to_string(),
            message: e.to_string(),
        };
        self.db
            .ensure_table(target.table.as_str(), &target.columns)
            .await
            .map_err(failure)?;
        if !writes.is_noop() {
            self.db.apply_writes(&writes).await.map_err(failure)?;
        }

        let key_entries = key_index.commit_entries(&plan.classified, &plan.committed_rows())?;
        let committed = self.state.commit_state(&StateCommit {
            source: target.source.clone(),
            table: target.table.clone(),
            run_id: run_id.to_string(),
            batch_id,
            watermark,
            key_entries,
            reset_reason: full_refresh.then(|| format!("full refresh in run {run_id}")),
            baseline: plan.stats.metrics(),
        })?;

        let mut outcome = MergeOutcome::planned(target, plan);
        outcome.phase = RunPhase::Committed;
        outcome.watermark = Some(committed.high_water_value.clone());
        for warning in &outcome.warnings {
            log::warn!("{}: {warning}", target.table);
        }
        log::info!(
            "{}: committed batch {} ({} inserted, {} updated, {} deleted, watermark {})",
            target.table,
            batch_id,
            outcome.rows_inserted,
            outcome.rows_updated,
            outcome.rows_deleted,
            committed.high_water_value
        );
        Ok(outcome)
    }

    fn write_set(&self, target: &MergeTarget, plan: &MergePlan) -> WriteSet {
        let batch = &plan.classified.batch;
        let mut writes = WriteSet::new(
            target.table.as_str(),
            target.columns.clone(),
            target.key_columns.clone(),
        );
        writes.partition_column = target.partition_column.clone();
        writes.partitions = plan.partitions.clone();
        writes.truncate = plan.full_refresh();
        for &index in &plan.write_rows {
            if let Some(row) = batch.row(index) {
                writes.upserts.push(
                    target
                        .columns
                        .iter()
                        .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }
        for &index in &plan.delete_rows {
            if let Some(row) = batch.row(index) {
                writes.deletes.push(
                    target
                        .key_columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }
        writes
    }

    async fn quarantine(
        &self,
        target: &MergeTarget,
        plan: &MergePlan,
        run_id: &str,
    ) -> MergeResult<MergeOutcome> {
        let batch = &plan.classified.batch;
        let reason = plan.reason.clone().unwrap_or_else(|| "quarantined".into());
        let now = Utc::now();
        let rows: Vec<QuarantineRow> = batch
            .iter()
            .map(|row| QuarantineRow {
                run_id: run_id.to_string(),
                batch_id: batch.batch_id(),
                source_file: batch.source_file().to_string(),
                row_json: row.to_json().to_string(),
                reason: reason.clone(),
                quarantined_at: now,
            })
            .collect();
        let written = self
            .db
            .write_quarantine(target.table.as_str(), &rows)
            .await
            .map_err(|e| MergeError::QuarantineFailed {
                table: target.table.to_string(),
                message: e.to_string(),
            })?;

        let mut outcome = MergeOutcome::planned(target, plan);
        outcome.phase = RunPhase::Quarantined;
        outcome.rows_inserted = 0;
        outcome.rows_updated = 0;
        outcome.rows_deleted = 0;
        outcome.rows_quarantined = written;
        outcome.watermark = self
            .state
            .get_watermark(&target.source, &target.table)?
            .map(|w| w.high_water_value);
        log::warn!(
            "{}: batch {} quarantined ({written} row(s)): {reason}",
            target.table,
            batch.batch_id()
        );
        Ok(outcome)
    }
}

/// `base` raised to the largest watermark-column value in `batch`.
pub fn batch_high_water(
    batch: &RecordBatch,
    column: &str,
    base: WatermarkValue,
) -> MergeResult<WatermarkValue> {
    Ok(batch.column(column)?.fold(base, WatermarkValue::max_with))
}

#[cfg(test)]
#[path = "executor_test.rs"]
mod tests;
