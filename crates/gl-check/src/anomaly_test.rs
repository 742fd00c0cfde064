use super::*;
use gl_core::{BatchMeta, BatchSchema, ColumnDef, ColumnType, Layer, Row, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

fn stats(rows: usize, partitions: &[(Option<&str>, usize)]) -> BatchStats {
    BatchStats {
        row_count: rows,
        distinct_keys: rows,
        partition_rows: partitions
            .iter()
            .map(|(p, n)| (p.map(str::to_string), *n))
            .collect(),
        orphan_rows: 0,
    }
}

fn daily_baseline() -> AnomalyBaseline {
    AnomalyBaseline::new()
        .with_history(MetricKind::RowCount, [100.0, 100.0, 100.0])
        .with_history(MetricKind::DistinctKeys, [100.0, 100.0, 100.0])
        .with_history(MetricKind::PartitionSkew, [0.25, 0.25, 0.25])
        .with_history(MetricKind::OrphanRate, [0.0, 0.0, 0.0])
}

#[test]
fn test_row_count_explosion_is_flagged() {
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0);
    let verdict = detector.assess(&stats(20_000, &[(Some("2024-01"), 20_000)]), &daily_baseline());
    assert!(verdict.flagged);
    assert!(verdict.flagged_on(MetricKind::RowCount));
    assert!(verdict.flagged_on(MetricKind::PartitionSkew));
    assert!(!verdict.flagged_on(MetricKind::OrphanRate));
    assert!(verdict.score > 3.0);
}

#[test]
fn test_typical_batch_is_not_flagged() {
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0);
    let verdict = detector.assess(
        &stats(
            104,
            &[(Some("a"), 26), (Some("b"), 26), (Some("c"), 26), (Some("d"), 26)],
        ),
        &daily_baseline(),
    );
    assert!(!verdict.flagged);
    assert_eq!(verdict.flagged_metrics().count(), 0);
}

#[test]
fn test_less_skew_is_never_flagged() {
    let baseline = AnomalyBaseline::new().with_history(MetricKind::PartitionSkew, [1.0, 1.0, 1.0]);
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0);
    let verdict = detector.assess(&stats(100, &[(Some("a"), 50), (Some("b"), 50)]), &baseline);
    assert!(!verdict.flagged_on(MetricKind::PartitionSkew));
}

#[test]
fn test_insufficient_history_never_flags() {
    let baseline = AnomalyBaseline::new().with_history(MetricKind::RowCount, [100.0, 100.0]);
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0);
    let verdict = detector.assess(&stats(50_000, &[(None, 50_000)]), &baseline);
    assert!(!verdict.flagged);
    let row_count = &verdict.metrics[0];
    assert_eq!(row_count.metric, MetricKind::RowCount);
    assert_eq!(row_count.status, MetricStatus::InsufficientHistory);
    assert_eq!(row_count.score, None);
    assert_eq!(verdict.score, 0.0);
}

#[test]
fn test_min_history_is_configurable() {
    let baseline = AnomalyBaseline::new().with_history(MetricKind::RowCount, [100.0]);
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0).with_min_history(1);
    let verdict = detector.assess(&stats(1_000, &[(None, 1_000)]), &baseline);
    assert!(verdict.flagged_on(MetricKind::RowCount));
}

#[test]
fn test_flat_history_still_scores() {
    let detector = AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0);
    let verdict = detector.assess(&stats(100, &[(Some("a"), 25), (Some("b"), 75)]), &daily_baseline());
    let row_count = &verdict.metrics[0];
    assert_eq!(row_count.score, Some(0.0));
    assert_eq!(row_count.expected, Some(100.0));
}

#[test]
fn test_percentile_strategy() {
    let baseline = AnomalyBaseline::new()
        .with_history(MetricKind::RowCount, [90.0, 100.0, 110.0, 100.0, 95.0]);
    let config = AnomalyConfig {
        strategy: AnomalyStrategy::Percentile,
        quantile: 1.0,
        ..AnomalyConfig::default()
    };
    let detector = AnomalyDetector::from_config(&config, 2.0);

    let verdict = detector.assess(&stats(200, &[(None, 200)]), &baseline);
    assert!(!verdict.flagged_on(MetricKind::RowCount));
    assert_eq!(verdict.metrics[0].expected, Some(110.0));

    let verdict = detector.assess(&stats(500, &[(None, 500)]), &baseline);
    assert!(verdict.flagged_on(MetricKind::RowCount));
}

#[test]
fn test_collect_measures_batch() {
    let schema = Arc::new(
        BatchSchema::new(vec![
            ColumnDef::new("claim_id", ColumnType::Text),
            ColumnDef::new("month", ColumnType::Text),
        ])
        .unwrap(),
    );
    let meta = BatchMeta::new("claims.csv", 1, Layer::Intermediate);
    let row = |id: &str, month: Option<&str>| {
        Row::new(
            vec![
                Value::Text(id.into()),
                month.map(|m| Value::Text(m.into())).unwrap_or(Value::Null),
            ],
            meta.provenance(None),
        )
    };
    let rows = vec![
        row("C1", Some("2024-01")),
        row("C1", Some("2024-01")),
        row("C2", Some("2024-01")),
        row("C3", None),
    ];
    let batch = RecordBatch::new(meta.clone(), schema, rows).unwrap();

    let key = ["claim_id".to_string()];
    let none = HashSet::new();
    let stats = BatchStats::collect(&batch, &key, Some("month"), &none, &BTreeSet::from([3])).unwrap();
    assert_eq!(stats.row_count, 4);
    assert_eq!(stats.distinct_keys, 3);
    assert_eq!(stats.partition_rows.get(&None), Some(&1));
    assert_eq!(stats.partition_skew(), 0.75);
    assert_eq!(stats.orphan_rate(), 0.25);
    assert_eq!(stats.metrics().len(), 4);

    assert!(BatchStats::collect(&batch, &key, Some("missing"), &none, &BTreeSet::new()).is_err());
}

#[test]
fn test_collect_leaves_out_skipped_rows() {
    let schema = Arc::new(BatchSchema::text(&["claim_id", "month"]).unwrap());
    let meta = BatchMeta::new("claims.csv", 2, Layer::Staging);
    let rows = [("C1", "2024-01"), ("C2", "2024-01"), ("C3", "2024-02")]
        .iter()
        .map(|(id, month)| {
            Row::new(
                vec![Value::Text(id.to_string()), Value::Text(month.to_string())],
                meta.provenance(None),
            )
        })
        .collect();
    let batch = RecordBatch::new(meta, schema, rows).unwrap();

    let stats = BatchStats::collect(
        &batch,
        &["claim_id".to_string()],
        Some("month"),
        &HashSet::from([0, 1]),
        &BTreeSet::from([1, 2]),
    )
    .unwrap();
    assert_eq!(stats.row_count, 1);
    assert_eq!(stats.distinct_keys, 1);
    assert_eq!(stats.partition_rows.get(&Some("2024-01".to_string())), None);
    assert_eq!(stats.orphan_rows, 1);
    assert_eq!(stats.partition_skew(), 1.0);
}

#[test]
fn test_empty_batch_stats() {
    let s = stats(0, &[]);
    assert_eq!(s.partition_skew(), 0.0);
    assert_eq!(s.orphan_rate(), 0.0);
}
