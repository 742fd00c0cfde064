//! gl-merge - incremental merge engine
//!
//! Per table and batch: [`KeyIndex`] classifies rows, [`MergePlanner`]
//! turns classifications and check verdicts into a [`MergePlan`], and
//! [`MergeExecutor`] applies the plan under a partition lock, committing
//! key index, watermark and baselines only after the physical write.

pub mod classify;
pub mod error;
pub mod executor;
pub mod lock;
pub mod plan;
pub mod planner;

#[cfg(test)]
pub(crate) mod test_support;

pub use classify::{ClassCounts, ClassifiedBatch, ClassifiedRow, KeyIndex, RowAction};
pub use error::{MergeError, MergeResult};
pub use executor::{batch_high_water, MergeExecutor, MergeOutcome, RunPhase};
pub use lock::{PartitionGuard, PartitionLocks};
pub use plan::{MergeAction, MergePlan, MergeTarget};
pub use planner::MergePlanner;
