//! KeyIndex: classify incoming rows against known business keys.
//!
//! Classification reads the index and never writes it. The entries to
//! commit are derived here but persisted by the executor, after the
//! physical write succeeded.

use crate::error::MergeResult;
use gl_core::{
    BusinessKey, Config, Fingerprint, KeyEntry, Layer, PartitionValue, RecordBatch, RowRef,
    TableConfig, TableName,
};
use gl_meta::KeyIndexStore;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Insert,
    Update,
    NoOp,
    Duplicate,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::NoOp => "no_op",
            RowAction::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one input row.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRow {
    pub index: usize,
    pub action: RowAction,
    /// `None` when a key column is null; such rows never reach the index
    pub key: Option<BusinessKey>,
    pub fingerprint: Fingerprint,
    pub partition: PartitionValue,
    /// Index entry before this batch
    pub previous: Option<KeyEntry>,
    /// Delete-flagged row removing a live key
    pub tombstone: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub insert: usize,
    pub update: usize,
    pub no_op: usize,
    pub duplicate: usize,
    /// Updates that tombstone their key
    pub tombstone: usize,
}

/// A batch together with its per-row classification.
#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    pub batch: RecordBatch,
    pub rows: Vec<ClassifiedRow>,
    pub full_refresh: bool,
}

impl ClassifiedBatch {
    pub fn counts(&self) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for row in &self.rows {
            match row.action {
                RowAction::Insert => counts.insert += 1,
                RowAction::Update => counts.update += 1,
                RowAction::NoOp => counts.no_op += 1,
                RowAction::Duplicate => counts.duplicate += 1,
            }
            if row.tombstone {
                counts.tombstone += 1;
            }
        }
        counts
    }

    /// Indices of rows classified as duplicates
    pub fn duplicates(&self) -> HashSet<usize> {
        self.rows
            .iter()
            .filter(|r| r.action == RowAction::Duplicate)
            .map(|r| r.index)
            .collect()
    }

    /// Indices of winners that already match the index
    pub fn unchanged(&self) -> HashSet<usize> {
        self.rows
            .iter()
            .filter(|r| r.action == RowAction::NoOp)
            .map(|r| r.index)
            .collect()
    }

    /// No row would change the target. Never true on a full refresh.
    pub fn is_unchanged(&self) -> bool {
        !self.full_refresh
            && self
                .rows
                .iter()
                .all(|r| matches!(r.action, RowAction::NoOp | RowAction::Duplicate))
    }

    /// Action per row, in input order
    pub fn actions(&self) -> Vec<RowAction> {
        self.rows.iter().map(|r| r.action).collect()
    }

    /// Rows left after duplicate exclusion
    pub fn winners(&self) -> impl Iterator<Item = &ClassifiedRow> {
        self.rows.iter().filter(|r| r.action != RowAction::Duplicate)
    }
}

/// Known business keys of one target table.
pub struct KeyIndex<'a> {
    store: &'a dyn KeyIndexStore,
    table: TableName,
    key_columns: Vec<String>,
    mutable_columns: Vec<String>,
    partition_column: Option<String>,
    delete_flag_column: Option<String>,
}

impl<'a> KeyIndex<'a> {
    pub fn new(
        store: &'a dyn KeyIndexStore,
        table: TableName,
        key_columns: Vec<String>,
        mutable_columns: Vec<String>,
    ) -> Self {
        Self {
            store,
            table,
            key_columns,
            mutable_columns,
            partition_column: None,
            delete_flag_column: None,
        }
    }

    pub fn with_partition_column(mut self, column: Option<String>) -> Self {
        self.partition_column = column;
        self
    }

    pub fn with_delete_flag(mut self, column: Option<String>) -> Self {
        self.delete_flag_column = column;
        self
    }

    /// Index of `table`'s target at `layer`.
    pub fn for_table(
        store: &'a dyn KeyIndexStore,
        config: &Config,
        table: &TableConfig,
        layer: Layer,
    ) -> MergeResult<Self> {
        let target = TableName::parse(table.target_for(layer, &config.layers))?;
        Ok(Self::new(
            store,
            target,
            table.grain_key.clone(),
            table.mutable_columns_for(layer),
        )
        .with_partition_column(table.partition_column.clone())
        .with_delete_flag(table.delete_flag_column.clone()))
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    fn partition_of(&self, row: &RowRef<'_>) -> PartitionValue {
        self.partition_column
            .as_deref()
            .and_then(|c| row.get(c))
            .filter(|v| !v.is_null())
            .map(|v| v.canonical())
    }

    fn is_delete(&self, row: &RowRef<'_>) -> bool {
        self.delete_flag_column
            .as_deref()
            .and_then(|c| row.get(c))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Classify every row of `batch`.
    ///
    /// Per key the winner is the row with the latest `ingested_at`, ties
    /// going to the earliest row; the others are duplicates. In full
    /// refresh mode existing entries are ignored.
    pub fn classify(&self, batch: RecordBatch, full_refresh: bool) -> MergeResult<ClassifiedBatch> {
        let schema = batch.schema();
        for col in self.key_columns.iter().chain(&self.mutable_columns) {
            schema.require(col)?;
        }
        for col in self.partition_column.iter().chain(&self.delete_flag_column) {
            schema.require(col)?;
        }

        let mut rows = Vec::with_capacity(batch.len());
        let mut winners: HashMap<BusinessKey, usize> = HashMap::new();
        for row in batch.iter() {
            let key = BusinessKey::from_row(&row, self.key_columns.as_slice())?;
            let fingerprint = Fingerprint::of_row(&row, self.mutable_columns.as_slice())?;
            if let Some(key) = &key {
                let ingested_at = row.provenance().ingested_at;
                let replace = match winners.get(key) {
                    Some(&current) => batch
                        .row(current)
                        .is_some_and(|w| ingested_at > w.provenance().ingested_at),
                    None => true,
                };
                if replace {
                    winners.insert(key.clone(), row.index());
                }
            }
            rows.push(ClassifiedRow {
                index: row.index(),
                action: RowAction::Insert,
                key,
                fingerprint,
                partition: self.partition_of(&row),
                previous: None,
                tombstone: false,
            });
        }

        let known = if full_refresh {
            HashMap::new()
        } else {
            let keys: Vec<&BusinessKey> = winners.keys().collect();
            self.store.lookup_keys(&self.table, &keys)?
        };

        for classified in rows.iter_mut() {
            let Some(key) = &classified.key else {
                continue;
            };
            if winners.get(key) != Some(&classified.index) {
                classified.action = RowAction::Duplicate;
                continue;
            }
            let previous = known.get(key).cloned();
            let delete = batch
                .row(classified.index)
                .is_some_and(|r| self.is_delete(&r));
            classified.action = match (&previous, delete) {
                (Some(entry), true) if entry.is_live() => {
                    classified.tombstone = true;
                    RowAction::Update
                }
                (_, true) => RowAction::NoOp,
                (None, false) => RowAction::Insert,
                (Some(entry), false) if entry.is_deleted => RowAction::Update,
                (Some(entry), false) if entry.fingerprint != classified.fingerprint => {
                    RowAction::Update
                }
                (Some(_), false) => RowAction::NoOp,
            };
            classified.previous = previous;
        }

        let classified = ClassifiedBatch {
            batch,
            rows,
            full_refresh,
        };
        let counts = classified.counts();
        log::debug!(
            "{}: classified {} rows (insert {}, update {}, no-op {}, duplicate {})",
            self.table,
            classified.rows.len(),
            counts.insert,
            counts.update,
            counts.no_op,
            counts.duplicate
        );
        Ok(classified)
    }

    /// Entries to commit once `written` rows are physically in the target.
    ///
    /// Tombstoning rows mark their key deleted. In full refresh mode every
    /// live key absent from `written` is tombstoned as well.
    pub fn commit_entries(
        &self,
        classified: &ClassifiedBatch,
        written: &BTreeSet<usize>,
    ) -> MergeResult<Vec<KeyEntry>> {
        let batch_id = classified.batch.batch_id();
        let mut entries = Vec::new();
        let mut present: HashSet<&BusinessKey> = HashSet::new();
        for row in classified.rows.iter().filter(|r| written.contains(&r.index)) {
            let Some(key) = &row.key else {
                continue;
            };
            present.insert(key);
            let partition = if row.tombstone {
                row.previous
                    .as_ref()
                    .and_then(|p| p.partition.clone())
                    .or_else(|| row.partition.clone())
            } else {
                row.partition.clone()
            };
            entries.push(KeyEntry {
                key: key.clone(),
                fingerprint: row.fingerprint.clone(),
                last_seen_batch_id: batch_id,
                is_deleted: row.tombstone,
                partition,
            });
        }

        if classified.full_refresh {
            let live = self.store.key_entries(&self.table, true)?;
            let before = entries.len();
            for entry in live.into_iter().filter(|e| !present.contains(&e.key)) {
                entries.push(KeyEntry {
                    last_seen_batch_id: batch_id,
                    is_deleted: true,
                    ..entry
                });
            }
            if entries.len() > before {
                log::info!(
                    "{}: full refresh tombstones {} absent key(s)",
                    self.table,
                    entries.len() - before
                );
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
#[path = "classify_test.rs"]
mod tests;
