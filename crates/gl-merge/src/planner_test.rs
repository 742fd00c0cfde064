use super::*;
use crate::test_support::{batch, key_index, plan_batch, source, Scenario};
use gl_core::{AnomalyBaseline, RecordBatch, Value, WatermarkValue};
use gl_meta::{MetaDb, StateCommit, StateStore};

fn months(values: &[&str]) -> PartitionSet {
    PartitionSet::Values(values.iter().map(|v| Some(v.to_string())).collect())
}

fn seed(db: &MetaDb, claims: &[crate::test_support::Claim<'_>]) {
    let index = key_index(db);
    let classified = index.classify(batch(1, claims), false).unwrap();
    let all: BTreeSet<usize> = (0..claims.len()).collect();
    db.commit_state(&StateCommit {
        source: source(),
        table: index.table().clone(),
        run_id: "seed".into(),
        batch_id: 1,
        watermark: WatermarkValue::At(Value::Int(1)),
        key_entries: index.commit_entries(&classified, &all).unwrap(),
        reset_reason: None,
        baseline: Vec::new(),
    })
    .unwrap();
}

#[test]
fn test_clean_batch_proceeds() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 100, "2024-01", 1, false),
                (Some("B"), 200, "2024-02", 1, false),
            ],
        ),
        &Scenario::default(),
    );
    assert_eq!(plan.action, MergeAction::Proceed);
    assert!(plan.warnings.is_empty());
    assert_eq!(plan.write_rows, BTreeSet::from([0, 1]));
    assert_eq!(plan.partitions, months(&["2024-01", "2024-02"]));
    assert_eq!(plan.counts.insert, 2);
}

#[test]
fn test_null_key_aborts() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 100, "2024-01", 1, false),
                (None, 200, "2024-01", 1, false),
            ],
        ),
        &Scenario::default(),
    );
    assert_eq!(plan.action, MergeAction::Abort);
    assert!(plan.write_rows.is_empty());
    assert!(plan.reason.as_deref().unwrap().contains("grain violation"));
}

#[test]
fn test_duplicates_do_not_abort() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 100, "2024-01", 1, false),
                (Some("A"), 100, "2024-01", 1, false),
                (Some("B"), 100, "2024-01", 1, false),
            ],
        ),
        &Scenario::default(),
    );
    assert_eq!(plan.action, MergeAction::Proceed);
    assert_eq!(plan.write_rows, BTreeSet::from([0, 2]));
    assert_eq!(plan.counts.duplicate, 1);
}

fn volume_spike() -> RecordBatch {
    let claims: Vec<(Option<String>, i64)> =
        (0..40).map(|i| (Some(format!("C{i}")), i)).collect();
    let claims: Vec<crate::test_support::Claim<'_>> = claims
        .iter()
        .map(|(id, amount)| (id.as_deref(), *amount, "2024-01", 1, false))
        .collect();
    batch(1, &claims)
}

fn quiet_baseline() -> AnomalyBaseline {
    AnomalyBaseline::new().with_history(MetricKind::RowCount, [2.0, 2.0, 2.0])
}

#[test]
fn test_row_count_anomaly_quarantines_under_strict() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        volume_spike(),
        &Scenario {
            baseline: quiet_baseline(),
            ..Scenario::default()
        },
    );
    assert!(plan.anomaly.flagged_on(MetricKind::RowCount));
    assert_eq!(plan.action, MergeAction::Quarantine);
    assert!(plan.reason.as_deref().unwrap().contains("row_count"));
    assert!(plan.write_rows.is_empty());
}

#[test]
fn test_row_count_anomaly_warns_under_permissive() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        volume_spike(),
        &Scenario {
            policy: Policy::Permissive,
            baseline: quiet_baseline(),
            ..Scenario::default()
        },
    );
    assert_eq!(plan.action, MergeAction::ProceedWithWarning);
    assert!(plan.warnings[0].starts_with("anomaly on row_count"));
    assert_eq!(plan.write_rows.len(), 40);
}

#[test]
fn test_non_blocking_anomaly_downgrades_to_warning() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 1, "2024-01", 1, false),
                (Some("B"), 1, "2024-01", 1, false),
            ],
        ),
        &Scenario {
            baseline: AnomalyBaseline::new()
                .with_history(MetricKind::DistinctKeys, [40.0, 40.0, 40.0]),
            ..Scenario::default()
        },
    );
    assert!(plan.anomaly.flagged_on(MetricKind::DistinctKeys));
    assert_eq!(plan.action, MergeAction::ProceedWithWarning);
    assert_eq!(plan.write_rows.len(), 2);
}

#[test]
fn test_orphans_quarantine_under_strict() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 100, "2024-01", 1, false),
                (Some("B"), 100, "2031-01", 1, false),
            ],
        ),
        &Scenario {
            periods: Some(&["2024-01"]),
            ..Scenario::default()
        },
    );
    assert_eq!(plan.action, MergeAction::Quarantine);
    assert_eq!(plan.reason.as_deref(), Some("1 orphan row(s)"));
}

#[test]
fn test_orphans_excluded_under_permissive() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(
            1,
            &[
                (Some("A"), 100, "2024-01", 1, false),
                (Some("B"), 100, "2031-01", 1, false),
            ],
        ),
        &Scenario {
            policy: Policy::Permissive,
            periods: Some(&["2024-01"]),
            ..Scenario::default()
        },
    );
    assert_eq!(plan.action, MergeAction::ProceedWithWarning);
    assert_eq!(plan.grain.count(gl_check::ViolationKind::Orphan), 1);
    assert_eq!(plan.excluded_rows, BTreeSet::from([1]));
    assert_eq!(plan.write_rows, BTreeSet::from([0]));
    assert_eq!(plan.partitions, months(&["2024-01"]));
}

#[test]
fn test_redelivered_batch_writes_nothing() {
    let db = MetaDb::open_memory().unwrap();
    let claims = [
        (Some("A"), 100, "2024-01", 1, false),
        (Some("B"), 200, "2024-02", 1, false),
    ];
    seed(&db, &claims);
    let plan = plan_batch(&db, batch(1, &claims), &Scenario::default());
    assert_eq!(plan.action, MergeAction::Proceed);
    assert_eq!(plan.counts.no_op, 2);
    assert!(plan.write_rows.is_empty());
    assert!(plan.partitions.is_empty());
}

#[test]
fn test_partition_move_touches_old_and_new() {
    let db = MetaDb::open_memory().unwrap();
    seed(&db, &[(Some("A"), 100, "2024-01", 1, false)]);
    let plan = plan_batch(
        &db,
        batch(2, &[(Some("A"), 100, "2024-03", 2, false)]),
        &Scenario::default(),
    );
    assert_eq!(plan.counts.update, 1);
    assert_eq!(plan.partitions, months(&["2024-01", "2024-03"]));
}

#[test]
fn test_tombstone_goes_to_delete_rows() {
    let db = MetaDb::open_memory().unwrap();
    seed(&db, &[(Some("A"), 100, "2024-01", 1, false)]);
    let plan = plan_batch(
        &db,
        batch(2, &[(Some("A"), 100, "2024-01", 2, true)]),
        &Scenario::default(),
    );
    assert!(plan.write_rows.is_empty());
    assert_eq!(plan.delete_rows, BTreeSet::from([0]));
    assert_eq!(plan.partitions, months(&["2024-01"]));
}

#[test]
fn test_full_refresh_touches_all_partitions() {
    let db = MetaDb::open_memory().unwrap();
    let plan = plan_batch(
        &db,
        batch(1, &[(Some("A"), 100, "2024-01", 1, false)]),
        &Scenario {
            full_refresh: true,
            ..Scenario::default()
        },
    );
    assert_eq!(plan.partitions, PartitionSet::All);
    assert!(plan.full_refresh());
}

#[test]
fn test_unpartitioned_table_touches_all() {
    let db = MetaDb::open_memory().unwrap();
    let classified = key_index(&db)
        .classify(batch(1, &[(Some("A"), 100, "2024-01", 1, false)]), false)
        .unwrap();
    let stats = BatchStats {
        row_count: 1,
        distinct_keys: 1,
        partition_rows: Default::default(),
        orphan_rows: 0,
    };
    let anomaly = gl_check::AnomalyDetector::new(gl_core::AnomalyStrategy::Zscore, 3.0)
        .assess(&stats, &AnomalyBaseline::new());
    let plan = MergePlanner::new(crate::test_support::table(), Policy::Strict)
        .with_partitioning(false)
        .plan(classified, GrainVerdict::default(), anomaly, stats);
    assert_eq!(plan.partitions, PartitionSet::All);
    assert_eq!(plan.write_rows, BTreeSet::from([0]));
}
