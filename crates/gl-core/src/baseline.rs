//! Anomaly baselines: rolling windows of metric values from accepted runs.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Batch metric tracked against history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    RowCount,
    DistinctKeys,
    /// Largest partition's share of the batch
    PartitionSkew,
    OrphanRate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::RowCount,
        MetricKind::DistinctKeys,
        MetricKind::PartitionSkew,
        MetricKind::OrphanRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::RowCount => "row_count",
            MetricKind::DistinctKeys => "distinct_keys",
            MetricKind::PartitionSkew => "partition_skew",
            MetricKind::OrphanRate => "orphan_rate",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CoreError::ConfigInvalid {
                message: format!("unknown metric '{s}'"),
            })
    }
}

/// Per-metric history for one table, oldest value first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyBaseline {
    history: BTreeMap<MetricKind, Vec<f64>>,
}

impl AnomalyBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline with a fixed history for one metric.
    pub fn with_history(mut self, metric: MetricKind, values: impl IntoIterator<Item = f64>) -> Self {
        self.history.entry(metric).or_default().extend(values);
        self
    }

    /// Append a value, dropping the oldest beyond `window`.
    pub fn push(&mut self, metric: MetricKind, value: f64, window: usize) {
        let values = self.history.entry(metric).or_default();
        values.push(value);
        if values.len() > window {
            let excess = values.len() - window;
            values.drain(..excess);
        }
    }

    pub fn values(&self, metric: MetricKind) -> &[f64] {
        self.history.get(&metric).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, metric: MetricKind) -> usize {
        self.values(metric).len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.values().all(Vec::is_empty)
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Linear-interpolated quantile, `q` in `[0, 1]`.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut b = AnomalyBaseline::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            b.push(MetricKind::RowCount, v, 3);
        }
        assert_eq!(b.values(MetricKind::RowCount), &[2.0, 3.0, 4.0]);
        assert_eq!(b.len(MetricKind::OrphanRate), 0);
    }

    #[test]
    fn test_stats() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&v), Some(5.0));
        assert_eq!(std_dev(&v), Some(2.0));
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.5), Some(3.0));
        assert_eq!(quantile(&[10.0, 20.0], 0.25), Some(12.5));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_metric_names_roundtrip() {
        for m in MetricKind::ALL {
            assert_eq!(m.as_str().parse::<MetricKind>().unwrap(), m);
        }
    }
}
