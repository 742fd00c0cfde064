//! Write requests handed from the merge executor to the backend.

use chrono::{DateTime, Utc};
use gl_core::{ColumnDef, PartitionSet, Value};
use serde::Serialize;

/// Physical changes for one target table.
///
/// Rows in `upserts` follow `columns` order. Each upsert first removes any
/// row with the same key inside `partitions`, then inserts; `deletes` hold
/// key values in `key_columns` order and only remove.
#[derive(Debug, Clone)]
pub struct WriteSet {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub key_columns: Vec<String>,
    pub partition_column: Option<String>,
    pub partitions: PartitionSet,
    pub upserts: Vec<Vec<Value>>,
    pub deletes: Vec<Vec<Value>>,
    /// Empty the table before writing (full refresh)
    pub truncate: bool,
}

impl WriteSet {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDef>, key_columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            key_columns,
            partition_column: None,
            partitions: PartitionSet::All,
            upserts: Vec::new(),
            deletes: Vec::new(),
            truncate: false,
        }
    }

    /// Nothing to do
    pub fn is_noop(&self) -> bool {
        !self.truncate && self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub(crate) fn key_positions(&self) -> Option<Vec<usize>> {
        self.key_columns
            .iter()
            .map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }
}

/// Rows removed and inserted by one write set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_deleted: usize,
    pub rows_inserted: usize,
}

/// A row parked in the quarantine side table.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineRow {
    pub run_id: String,
    pub batch_id: u64,
    pub source_file: String,
    pub row_json: String,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}
