//! Merge plans: the chosen action plus the row sets it writes.

use crate::classify::{ClassCounts, ClassifiedBatch};
use crate::error::MergeResult;
use gl_check::{AnomalyVerdict, BatchStats, GrainVerdict};
use gl_core::{ColumnDef, Config, Layer, PartitionSet, Policy, SourceName, TableConfig, TableName};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// What the executor does with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Proceed,
    ProceedWithWarning,
    Quarantine,
    Abort,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Proceed => "proceed",
            MergeAction::ProceedWithWarning => "proceed_with_warning",
            MergeAction::Quarantine => "quarantine",
            MergeAction::Abort => "abort",
        }
    }

    /// Whether the target is written
    pub fn writes(&self) -> bool {
        matches!(self, MergeAction::Proceed | MergeAction::ProceedWithWarning)
    }
}

impl fmt::Display for MergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical target of a merge: table, columns and watermark source.
#[derive(Debug, Clone)]
pub struct MergeTarget {
    pub table: TableName,
    pub source: SourceName,
    pub columns: Vec<ColumnDef>,
    pub key_columns: Vec<String>,
    pub partition_column: Option<String>,
    pub watermark_column: String,
}

impl MergeTarget {
    pub fn for_table(config: &Config, table: &TableConfig, layer: Layer) -> MergeResult<Self> {
        Ok(Self {
            table: TableName::parse(table.target_for(layer, &config.layers))?,
            source: SourceName::parse(table.source.clone())?,
            columns: table.columns_for(layer),
            key_columns: table.grain_key.clone(),
            partition_column: table.partition_column.clone(),
            watermark_column: table.watermark_column.clone(),
        })
    }
}

/// Everything the executor needs to apply one batch.
///
/// Plans are transient; they are consumed by [`MergeExecutor::execute`](crate::MergeExecutor::execute).
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub table: TableName,
    pub action: MergeAction,
    pub policy: Policy,
    /// Partitions the write may touch
    pub partitions: PartitionSet,
    pub counts: ClassCounts,
    pub grain: GrainVerdict,
    pub anomaly: AnomalyVerdict,
    pub stats: BatchStats,
    pub warnings: Vec<String>,
    /// Inserted or updated rows
    pub write_rows: BTreeSet<usize>,
    /// Rows whose key is removed from the target
    pub delete_rows: BTreeSet<usize>,
    /// Rows dropped from the write by policy
    pub excluded_rows: BTreeSet<usize>,
    /// Why the batch was quarantined or aborted
    pub reason: Option<String>,
    pub classified: ClassifiedBatch,
}

impl MergePlan {
    pub fn batch_id(&self) -> u64 {
        self.classified.batch.batch_id()
    }

    pub fn full_refresh(&self) -> bool {
        self.classified.full_refresh
    }

    /// Rows whose key index entry changes on commit
    pub fn committed_rows(&self) -> BTreeSet<usize> {
        self.write_rows.union(&self.delete_rows).copied().collect()
    }
}
