//! MergePlanner: turn classification and check verdicts into an action.

use crate::classify::{ClassifiedBatch, RowAction};
use crate::plan::{MergeAction, MergePlan};
use gl_check::{AnomalyVerdict, BatchStats, GrainVerdict, ViolationKind};
use gl_core::{MetricKind, PartitionSet, Policy, TableName};
use std::collections::BTreeSet;

/// Metrics whose flag quarantines a batch under the strict policy
const BLOCKING_METRICS: [MetricKind; 2] = [MetricKind::RowCount, MetricKind::PartitionSkew];

#[derive(Debug, Clone)]
pub struct MergePlanner {
    table: TableName,
    policy: Policy,
    partition_aware: bool,
}

impl MergePlanner {
    pub fn new(table: TableName, policy: Policy) -> Self {
        Self {
            table,
            policy,
            partition_aware: true,
        }
    }

    /// Tables without a partition column touch every partition.
    pub fn with_partitioning(mut self, partitioned: bool) -> Self {
        self.partition_aware = partitioned;
        self
    }

    /// Decide the action for a classified batch. First match wins:
    /// grain violations abort; a flagged row count or skew quarantines under
    /// strict; orphans quarantine under strict and are dropped under
    /// permissive; anything else proceeds.
    pub fn plan(
        &self,
        classified: ClassifiedBatch,
        grain: GrainVerdict,
        anomaly: AnomalyVerdict,
        stats: BatchStats,
    ) -> MergePlan {
        let mut plan = MergePlan {
            table: self.table.clone(),
            action: MergeAction::Proceed,
            policy: self.policy,
            partitions: PartitionSet::empty(),
            counts: classified.counts(),
            grain,
            anomaly,
            stats,
            warnings: Vec::new(),
            write_rows: BTreeSet::new(),
            delete_rows: BTreeSet::new(),
            excluded_rows: BTreeSet::new(),
            reason: None,
            classified,
        };

        if plan.grain.has_grain_violations() {
            let count = plan
                .grain
                .violations
                .iter()
                .filter(|v| v.kind.is_grain())
                .count();
            plan.action = MergeAction::Abort;
            plan.reason = Some(format!("{count} grain violation(s)"));
            return plan;
        }

        if self.policy == Policy::Strict {
            let blocking: Vec<String> = BLOCKING_METRICS
                .iter()
                .filter(|m| plan.anomaly.flagged_on(**m))
                .map(|m| m.to_string())
                .collect();
            if !blocking.is_empty() {
                plan.action = MergeAction::Quarantine;
                plan.reason = Some(format!("anomaly flagged on {}", blocking.join(", ")));
                return plan;
            }
        }

        let orphans = plan.grain.orphan_rows();
        if !orphans.is_empty() {
            match self.policy {
                Policy::Strict => {
                    plan.action = MergeAction::Quarantine;
                    plan.reason = Some(format!("{} orphan row(s)", orphans.len()));
                    return plan;
                }
                Policy::Permissive => {
                    plan.action = MergeAction::ProceedWithWarning;
                    plan.warnings.push(format!(
                        "{} orphan row(s) excluded from the write",
                        orphans.len()
                    ));
                    plan.excluded_rows = orphans;
                }
            }
        }

        for metric in plan.anomaly.flagged_metrics() {
            plan.warnings.push(format!(
                "anomaly on {}: value {:.2}, expected {:.2}, score {:.2}",
                metric.metric,
                metric.value,
                metric.expected.unwrap_or_default(),
                metric.score.unwrap_or_default()
            ));
        }
        let temporal = plan.grain.count(ViolationKind::Temporal);
        if temporal > 0 {
            plan.warnings.push(format!("{temporal} temporal violation(s)"));
        }
        if !plan.warnings.is_empty() {
            plan.action = MergeAction::ProceedWithWarning;
        }

        self.fill_write_sets(&mut plan);
        plan
    }

    fn fill_write_sets(&self, plan: &mut MergePlan) {
        let scoped = self.partition_aware && !plan.classified.full_refresh;
        let mut partitions = if scoped {
            PartitionSet::empty()
        } else {
            PartitionSet::All
        };
        for row in &plan.classified.rows {
            if plan.excluded_rows.contains(&row.index) || row.key.is_none() {
                continue;
            }
            if row.action != RowAction::Insert && row.action != RowAction::Update {
                continue;
            }
            if row.tombstone {
                plan.delete_rows.insert(row.index);
            } else {
                plan.write_rows.insert(row.index);
                partitions.insert(row.partition.clone());
            }
            if let Some(previous) = &row.previous {
                partitions.insert(previous.partition.clone());
            }
        }
        plan.partitions = partitions;
    }
}

#[cfg(test)]
#[path = "planner_test.rs"]
mod tests;
