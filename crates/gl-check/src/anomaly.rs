//! AnomalyDetector: batch statistics against rolling baselines.
//!
//! Findings only. A flagged verdict never blocks by itself; the merge
//! planner decides what to do with it.

use gl_core::baseline::{mean, quantile, std_dev};
use gl_core::{
    AnomalyBaseline, AnomalyConfig, AnomalyStrategy, BusinessKey, CoreResult, MetricKind,
    PartitionValue, RecordBatch,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Relative floor on sigma so flat histories still produce finite scores
const SIGMA_FLOOR_RATIO: f64 = 0.05;
/// Absolute floor for histories at zero
const MIN_SIGMA: f64 = 0.01;

/// Metrics measured on one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStats {
    pub row_count: usize,
    pub distinct_keys: usize,
    pub partition_rows: BTreeMap<PartitionValue, usize>,
    pub orphan_rows: usize,
}

impl BatchStats {
    /// Measure `batch`, leaving out the `skip` rows. Null grain keys are
    /// not counted as distinct keys; `orphans` in `skip` are not counted.
    pub fn collect(
        batch: &RecordBatch,
        grain_key: &[String],
        partition_column: Option<&str>,
        skip: &HashSet<usize>,
        orphans: &BTreeSet<usize>,
    ) -> CoreResult<Self> {
        let mut keys: HashSet<BusinessKey> = HashSet::new();
        let mut partition_rows: BTreeMap<PartitionValue, usize> = BTreeMap::new();
        if let Some(col) = partition_column {
            batch.schema().require(col)?;
        }
        let mut row_count = 0usize;
        for row in batch.iter().filter(|r| !skip.contains(&r.index())) {
            row_count += 1;
            if let Some(key) = BusinessKey::from_row(&row, grain_key)? {
                keys.insert(key);
            }
            let partition = partition_column
                .and_then(|c| row.get(c))
                .filter(|v| !v.is_null())
                .map(|v| v.canonical());
            *partition_rows.entry(partition).or_default() += 1;
        }
        Ok(Self {
            row_count,
            distinct_keys: keys.len(),
            partition_rows,
            orphan_rows: orphans.iter().filter(|i| !skip.contains(i)).count(),
        })
    }

    /// Largest partition's share of the batch's rows; 0 for an empty batch.
    pub fn partition_skew(&self) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        let largest = self.partition_rows.values().copied().max().unwrap_or(0);
        largest as f64 / self.row_count as f64
    }

    pub fn orphan_rate(&self) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        self.orphan_rows as f64 / self.row_count as f64
    }

    pub fn value(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::RowCount => self.row_count as f64,
            MetricKind::DistinctKeys => self.distinct_keys as f64,
            MetricKind::PartitionSkew => self.partition_skew(),
            MetricKind::OrphanRate => self.orphan_rate(),
        }
    }

    /// Every metric with its value, as appended to the baselines.
    pub fn metrics(&self) -> Vec<(MetricKind, f64)> {
        MetricKind::ALL
            .into_iter()
            .map(|m| (m, self.value(m)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Scored,
    InsufficientHistory,
}

/// One metric's deviation from its history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAssessment {
    pub metric: MetricKind,
    pub value: f64,
    /// Historical mean (zscore) or quantile (percentile)
    pub expected: Option<f64>,
    pub score: Option<f64>,
    pub flagged: bool,
    pub status: MetricStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyVerdict {
    pub strategy: AnomalyStrategy,
    pub threshold: f64,
    /// Highest metric score, 0 when nothing was scored
    pub score: f64,
    pub flagged: bool,
    pub metrics: Vec<MetricAssessment>,
}

impl AnomalyVerdict {
    pub fn flagged_on(&self, metric: MetricKind) -> bool {
        self.metrics.iter().any(|m| m.metric == metric && m.flagged)
    }

    pub fn flagged_metrics(&self) -> impl Iterator<Item = &MetricAssessment> {
        self.metrics.iter().filter(|m| m.flagged)
    }
}

/// Scores batch statistics against a table's baseline.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    strategy: AnomalyStrategy,
    threshold: f64,
    min_history: usize,
    quantile: f64,
}

impl AnomalyDetector {
    pub fn new(strategy: AnomalyStrategy, threshold: f64) -> Self {
        let defaults = AnomalyConfig::default();
        Self {
            strategy,
            threshold,
            min_history: defaults.min_history,
            quantile: defaults.quantile,
        }
    }

    /// Detector from project settings with a per-run threshold.
    pub fn from_config(config: &AnomalyConfig, threshold: f64) -> Self {
        Self {
            strategy: config.strategy,
            threshold,
            min_history: config.min_history,
            quantile: config.quantile,
        }
    }

    pub fn with_min_history(mut self, min_history: usize) -> Self {
        self.min_history = min_history;
        self
    }

    pub fn assess(&self, stats: &BatchStats, baseline: &AnomalyBaseline) -> AnomalyVerdict {
        let metrics: Vec<MetricAssessment> = MetricKind::ALL
            .into_iter()
            .map(|metric| self.assess_metric(metric, stats.value(metric), baseline.values(metric)))
            .collect();

        let score = metrics
            .iter()
            .filter_map(|m| m.score)
            .fold(0.0_f64, f64::max);
        let flagged = metrics.iter().any(|m| m.flagged);
        if flagged {
            let names: Vec<&str> = metrics
                .iter()
                .filter(|m| m.flagged)
                .map(|m| m.metric.as_str())
                .collect();
            log::debug!("Anomaly flagged on {} (score {score:.2})", names.join(", "));
        }
        AnomalyVerdict {
            strategy: self.strategy,
            threshold: self.threshold,
            score,
            flagged,
            metrics,
        }
    }

    fn assess_metric(&self, metric: MetricKind, value: f64, history: &[f64]) -> MetricAssessment {
        let insufficient = MetricAssessment {
            metric,
            value,
            expected: None,
            score: None,
            flagged: false,
            status: MetricStatus::InsufficientHistory,
        };
        if history.len() < self.min_history.max(1) {
            return insufficient;
        }
        let scored = match self.strategy {
            AnomalyStrategy::Zscore => mean(history).zip(std_dev(history)).map(|(mu, sd)| {
                let sigma = sd.max(mu.abs() * SIGMA_FLOOR_RATIO).max(MIN_SIGMA);
                let deviation = if upward_only(metric) {
                    (value - mu).max(0.0)
                } else {
                    (value - mu).abs()
                };
                (mu, deviation / sigma)
            }),
            AnomalyStrategy::Percentile => quantile(history, self.quantile)
                .map(|q| (q, value / q.abs().max(MIN_SIGMA))),
        };
        match scored {
            Some((expected, score)) => MetricAssessment {
                metric,
                value,
                expected: Some(expected),
                score: Some(score),
                flagged: score > self.threshold,
                status: MetricStatus::Scored,
            },
            None => insufficient,
        }
    }
}

/// Spread-out partitions and fewer orphans are never anomalies.
fn upward_only(metric: MetricKind) -> bool {
    matches!(metric, MetricKind::PartitionSkew | MetricKind::OrphanRate)
}

#[cfg(test)]
#[path = "anomaly_test.rs"]
mod tests;
