use super::*;
use crate::test_support::{batch, key_index, plan_batch, source, table, target, Claim, Scenario};
use gl_core::{MetricKind, Policy};
use gl_db::DuckDbBackend;
use gl_meta::{BaselineStore, KeyIndexStore, MetaDb, WatermarkStore};

struct Harness {
    db: Arc<DuckDbBackend>,
    meta: Arc<MetaDb>,
    locks: Arc<PartitionLocks>,
}

impl Harness {
    fn new() -> Self {
        Self {
            db: Arc::new(DuckDbBackend::in_memory().unwrap()),
            meta: Arc::new(MetaDb::open_memory().unwrap()),
            locks: PartitionLocks::new(),
        }
    }

    fn executor(&self, mode: LockMode) -> MergeExecutor {
        MergeExecutor::new(
            self.db.clone(),
            self.meta.clone(),
            Arc::clone(&self.locks),
            mode,
        )
    }

    async fn run(
        &self,
        batch_id: u64,
        claims: &[Claim<'_>],
        scenario: &Scenario<'_>,
    ) -> MergeResult<MergeOutcome> {
        let plan = plan_batch(&self.meta, batch(batch_id, claims), scenario);
        let index = key_index(self.meta.as_ref());
        self.executor(LockMode::FailFast)
            .execute(&target(), plan, &index, &format!("run-{batch_id}"))
            .await
    }

    async fn target_rows(&self) -> usize {
        self.db
            .query_count("SELECT * FROM fact.claims")
            .await
            .unwrap()
    }

    fn watermark(&self) -> Option<gl_core::Watermark> {
        self.meta.get_watermark(&source(), &table()).unwrap()
    }
}

fn at(v: i64) -> WatermarkValue {
    WatermarkValue::At(Value::Int(v))
}

const FIRST: [Claim<'static>; 2] = [
    (Some("A"), 100, "2024-01", 5, false),
    (Some("B"), 200, "2024-02", 7, false),
];

#[tokio::test]
async fn test_commit_writes_target_then_state() {
    let h = Harness::new();
    let outcome = h.run(1, &FIRST, &Scenario::default()).await.unwrap();

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.action, MergeAction::Proceed);
    assert_eq!(outcome.rows_inserted, 2);
    assert_eq!(outcome.watermark, Some(at(7)));
    assert_eq!(h.target_rows().await, 2);

    let wm = h.watermark().unwrap();
    assert_eq!(wm.high_water_value, at(7));
    assert_eq!(wm.last_batch_id, 1);
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 2);
    let baseline = h.meta.load_baseline(&table(), 30).unwrap();
    assert_eq!(baseline.values(MetricKind::RowCount), &[2.0]);
}

#[tokio::test]
async fn test_redelivered_batch_is_no_op() {
    let h = Harness::new();
    h.run(41, &FIRST, &Scenario::default()).await.unwrap();
    let outcome = h.run(41, &FIRST, &Scenario::default()).await.unwrap();

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.counts.no_op, 2);
    assert_eq!(outcome.rows_written(), 0);
    assert_eq!(h.target_rows().await, 2);
    let wm = h.watermark().unwrap();
    assert_eq!(wm.high_water_value, at(7));
    assert_eq!(wm.last_batch_id, 41);
}

#[tokio::test]
async fn test_update_moves_row_between_partitions() {
    let h = Harness::new();
    h.run(1, &FIRST, &Scenario::default()).await.unwrap();
    let outcome = h
        .run(2, &[(Some("A"), 150, "2024-03", 9, false)], &Scenario::default())
        .await
        .unwrap();

    assert_eq!(outcome.rows_updated, 1);
    assert_eq!(h.target_rows().await, 2);
    let month = h
        .db
        .query_one("SELECT month FROM fact.claims WHERE claim_id = 'A'")
        .await
        .unwrap();
    assert_eq!(month.as_deref(), Some("2024-03"));
    assert_eq!(h.watermark().unwrap().high_water_value, at(9));
}

#[tokio::test]
async fn test_tombstone_removes_row() {
    let h = Harness::new();
    h.run(1, &FIRST, &Scenario::default()).await.unwrap();
    let outcome = h
        .run(2, &[(Some("A"), 100, "2024-01", 8, true)], &Scenario::default())
        .await
        .unwrap();

    assert_eq!(outcome.rows_deleted, 1);
    assert_eq!(h.target_rows().await, 1);
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 1);
}

#[tokio::test]
async fn test_live_keys_match_target_rows() {
    let h = Harness::new();
    h.run(1, &FIRST, &Scenario::default()).await.unwrap();
    h.run(
        2,
        &[
            (Some("B"), 250, "2024-02", 9, false),
            (Some("C"), 300, "2024-02", 9, false),
            (Some("C"), 300, "2024-02", 9, false),
            (Some("A"), 100, "2024-01", 9, true),
        ],
        &Scenario::default(),
    )
    .await
    .unwrap();

    let distinct = h
        .db
        .query_count("SELECT DISTINCT claim_id FROM fact.claims")
        .await
        .unwrap();
    assert_eq!(distinct, h.meta.live_key_count(&table()).unwrap());
    assert_eq!(distinct, 2);
}

#[tokio::test]
async fn test_quarantine_leaves_target_and_watermark() {
    let h = Harness::new();
    h.run(1, &FIRST, &Scenario::default()).await.unwrap();
    let before = h.watermark().unwrap();

    let outcome = h
        .run(
            2,
            &[
                (Some("C"), 1, "2024-01", 20, false),
                (Some("D"), 1, "2031-01", 20, false),
            ],
            &Scenario {
                periods: Some(&["2024-01", "2024-02"]),
                ..Scenario::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.action, MergeAction::Quarantine);
    assert_eq!(outcome.phase, RunPhase::Quarantined);
    assert_eq!(outcome.rows_quarantined, 2);
    assert_eq!(outcome.rows_written(), 0);
    assert_eq!(h.target_rows().await, 2);
    assert_eq!(h.watermark().unwrap(), before);
    assert_eq!(
        h.db
            .query_count("SELECT * FROM fact.claims__quarantine")
            .await
            .unwrap(),
        2
    );
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 2);
}

#[tokio::test]
async fn test_permissive_orphan_excluded_from_write() {
    let h = Harness::new();
    let outcome = h
        .run(
            1,
            &[
                (Some("C"), 1, "2024-01", 20, false),
                (Some("D"), 1, "2031-01", 20, false),
            ],
            &Scenario {
                policy: Policy::Permissive,
                periods: Some(&["2024-01"]),
                ..Scenario::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.action, MergeAction::ProceedWithWarning);
    assert_eq!(outcome.rows_excluded, 1);
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(h.target_rows().await, 1);
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 1);
    assert_eq!(h.watermark().unwrap().high_water_value, at(20));
}

#[tokio::test]
async fn test_abort_writes_nothing() {
    let h = Harness::new();
    let outcome = h
        .run(1, &[(None, 1, "2024-01", 3, false)], &Scenario::default())
        .await
        .unwrap();

    assert_eq!(outcome.phase, RunPhase::Aborted);
    assert!(!outcome.violations.is_empty());
    assert!(!h.db.relation_exists("fact.claims").await.unwrap());
    assert!(h.watermark().is_none());
}

#[tokio::test]
async fn test_batch_regression_rejected_before_write() {
    let h = Harness::new();
    h.run(5, &FIRST, &Scenario::default()).await.unwrap();
    let err = h
        .run(4, &[(Some("Z"), 1, "2024-04", 30, false)], &Scenario::default())
        .await
        .unwrap_err();

    assert!(err.is_regression());
    assert_eq!(h.target_rows().await, 2);
    assert_eq!(h.watermark().unwrap().last_batch_id, 5);
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 2);
}

#[tokio::test]
async fn test_full_refresh_rewrites_target() {
    let h = Harness::new();
    h.run(5, &FIRST, &Scenario::default()).await.unwrap();
    let outcome = h
        .run(
            1,
            &[(Some("A"), 100, "2024-01", 2, false)],
            &Scenario {
                full_refresh: true,
                ..Scenario::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.partitions, PartitionSet::All);
    assert_eq!(h.target_rows().await, 1);
    assert_eq!(h.meta.live_key_count(&table()).unwrap(), 1);
    let wm = h.watermark().unwrap();
    assert_eq!(wm.high_water_value, at(2));
    assert_eq!(wm.last_batch_id, 1);
}

#[tokio::test]
async fn test_overlapping_lock_fails_fast() {
    let h = Harness::new();
    let _held = h
        .locks
        .acquire(&table(), PartitionSet::All, LockMode::FailFast)
        .await
        .unwrap();
    let err = h.run(1, &FIRST, &Scenario::default()).await.unwrap_err();

    assert!(matches!(err, MergeError::WriteConflict { .. }));
    assert!(h.watermark().is_none());
    assert!(!h.db.relation_exists("fact.claims").await.unwrap());
}

#[test]
fn test_batch_high_water_skips_nulls() {
    let b = batch(
        1,
        &[
            (Some("A"), 1, "2024-01", 4, false),
            (Some("B"), 1, "2024-01", 9, false),
        ],
    );
    assert_eq!(
        batch_high_water(&b, "updated_at", WatermarkValue::Beginning).unwrap(),
        at(9)
    );
    assert_eq!(batch_high_water(&b, "updated_at", at(12)).unwrap(), at(12));
    assert!(batch_high_water(&b, "loaded_at", at(1)).is_err());
}
