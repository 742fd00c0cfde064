use super::*;
use crate::query::watermarks::reset_count;
use gl_core::{Fingerprint, Value};

fn names() -> (SourceName, TableName) {
    (
        SourceName::parse("claims.csv").unwrap(),
        TableName::parse("fact.claims").unwrap(),
    )
}

fn at(v: i64) -> WatermarkValue {
    WatermarkValue::At(Value::Int(v))
}

fn entry(key: &str, fp: &str, batch: u64, deleted: bool) -> KeyEntry {
    KeyEntry {
        key: BusinessKey::from_stored(key),
        fingerprint: Fingerprint::from_stored(fp),
        last_seen_batch_id: batch,
        is_deleted: deleted,
        partition: Some("2024-01".to_string()),
    }
}

fn commit(batch_id: u64, watermark: i64, entries: Vec<KeyEntry>) -> StateCommit {
    let (source, table) = names();
    StateCommit {
        source,
        table,
        run_id: format!("run-{batch_id}"),
        batch_id,
        watermark: at(watermark),
        key_entries: entries,
        reset_reason: None,
        baseline: vec![(MetricKind::RowCount, 100.0 + batch_id as f64)],
    }
}


#[test]
fn test_advance_then_get() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    assert!(db.get_watermark(&source, &table).unwrap().is_none());

    db.advance_watermark(&source, &table, &at(10), 1).unwrap();
    let wm = db.get_watermark(&source, &table).unwrap().unwrap();
    assert_eq!(wm.high_water_value, at(10));
    assert_eq!(wm.last_batch_id, 1);
}

#[test]
fn test_advance_rejects_lower_value() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.advance_watermark(&source, &table, &at(10), 1).unwrap();

    let err = db.advance_watermark(&source, &table, &at(9), 2).unwrap_err();
    assert!(matches!(err, MetaError::WatermarkRegression { .. }));
    assert!(err.is_regression());
    assert_eq!(
        db.get_watermark(&source, &table).unwrap().unwrap().high_water_value,
        at(10)
    );
}

#[test]
fn test_advance_rejects_lower_batch_id_but_accepts_equal() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.advance_watermark(&source, &table, &at(10), 41).unwrap();

    let err = db.advance_watermark(&source, &table, &at(11), 40).unwrap_err();
    assert!(matches!(err, MetaError::BatchRegression { last: 41, attempted: 40, .. }));

    db.advance_watermark(&source, &table, &at(10), 41).unwrap();
    assert_eq!(db.get_watermark(&source, &table).unwrap().unwrap().last_batch_id, 41);
}

#[test]
fn test_advance_rejects_incomparable_value() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.advance_watermark(&source, &table, &at(10), 1).unwrap();
    let err = db
        .advance_watermark(&source, &table, &WatermarkValue::At(Value::Text("x".into())), 2)
        .unwrap_err();
    assert!(err.is_regression());
}

#[test]
fn test_reset_goes_to_beginning_and_is_audited() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.advance_watermark(&source, &table, &at(10), 5).unwrap();

    db.reset_watermark(&source, &table, "full refresh").unwrap();
    let wm = db.get_watermark(&source, &table).unwrap().unwrap();
    assert!(wm.high_water_value.is_beginning());
    assert_eq!(wm.last_batch_id, 0);
    assert_eq!(db.with_conn(|c| reset_count(c, &source, &table)).unwrap(), 1);

    // Lower values are accepted after a reset
    db.advance_watermark(&source, &table, &at(3), 1).unwrap();
}

#[test]
fn test_list_watermarks() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.advance_watermark(&source, &table, &at(1), 1).unwrap();
    db.advance_watermark(&SourceName::parse("plans.csv").unwrap(), &table, &at(2), 1)
        .unwrap();
    assert_eq!(db.list_watermarks().unwrap().len(), 2);
}

#[test]
fn test_commit_state_writes_everything() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    let wm = db
        .commit_state(&commit(
            1,
            10,
            vec![entry("A", "fa", 1, false), entry("B", "fb", 1, false)],
        ))
        .unwrap();
    assert_eq!(wm.high_water_value, at(10));

    assert_eq!(db.live_key_count(&table).unwrap(), 2);
    assert_eq!(
        db.get_watermark(&source, &table).unwrap().unwrap().last_batch_id,
        1
    );
    let baseline = db.load_baseline(&table, 30).unwrap();
    assert_eq!(baseline.values(MetricKind::RowCount), &[101.0]);
}

#[test]
fn test_commit_state_regression_mutates_nothing() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.commit_state(&commit(2, 10, vec![entry("A", "fa", 2, false)]))
        .unwrap();

    let err = db
        .commit_state(&commit(3, 5, vec![entry("B", "fb", 3, false)]))
        .unwrap_err();
    assert!(err.is_regression());

    assert_eq!(db.live_key_count(&table).unwrap(), 1);
    assert_eq!(db.load_baseline(&table, 30).unwrap().len(MetricKind::RowCount), 1);
    assert_eq!(
        db.get_watermark(&source, &table).unwrap().unwrap().high_water_value,
        at(10)
    );
}

#[test]
fn test_commit_state_with_reset_accepts_lower_watermark() {
    let db = MetaDb::open_memory().unwrap();
    let (source, table) = names();
    db.commit_state(&commit(7, 10, vec![entry("A", "fa", 7, false)]))
        .unwrap();

    let mut refresh = commit(1, 3, vec![entry("A", "fa", 1, true)]);
    refresh.reset_reason = Some("full refresh".into());
    db.commit_state(&refresh).unwrap();

    let wm = db.get_watermark(&source, &table).unwrap().unwrap();
    assert_eq!(wm.high_water_value, at(3));
    assert_eq!(wm.last_batch_id, 1);
    assert_eq!(db.with_conn(|c| reset_count(c, &source, &table)).unwrap(), 1);
    assert_eq!(db.live_key_count(&table).unwrap(), 0);
}

#[test]
fn test_key_lookup_spans_statements() {
    let db = MetaDb::open_memory().unwrap();
    let (_, table) = names();
    let entries: Vec<KeyEntry> = (0..1_200)
        .map(|i| entry(&format!("K{i}"), "fp", 1, false))
        .collect();
    db.commit_state(&commit(1, 1, entries)).unwrap();

    let keys: Vec<BusinessKey> = (0..1_201)
        .map(|i| BusinessKey::from_stored(format!("K{i}")))
        .collect();
    let refs: Vec<&BusinessKey> = keys.iter().collect();
    let found = db.lookup_keys(&table, &refs).unwrap();
    assert_eq!(found.len(), 1_200);
    assert!(found.contains_key(&keys[999]));
    assert!(!found.contains_key(&keys[1_200]));
}

#[test]
fn test_key_lookup_and_tombstones() {
    let db = MetaDb::open_memory().unwrap();
    let (_, table) = names();
    db.commit_state(&commit(
        1,
        1,
        vec![entry("A", "fa", 1, false), entry("B", "fb", 1, true)],
    ))
    .unwrap();

    let a = BusinessKey::from_stored("A");
    let b = BusinessKey::from_stored("B");
    let c = BusinessKey::from_stored("C");
    let found = db.lookup_keys(&table, &[&a, &b, &c]).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[&a].fingerprint.as_str(), "fa");
    assert_eq!(found[&a].partition.as_deref(), Some("2024-01"));
    assert!(found[&b].is_deleted);

    let live = db.live_keys_among(&table, &[&a, &b, &c]).unwrap();
    assert_eq!(live.len(), 1);
    assert!(live.contains(&a));

    assert_eq!(db.key_entries(&table, false).unwrap().len(), 2);
    assert_eq!(db.key_entries(&table, true).unwrap().len(), 1);
}

#[test]
fn test_baseline_window_keeps_most_recent() {
    let db = MetaDb::open_memory().unwrap();
    let (_, table) = names();
    for batch in 1..=5 {
        db.commit_state(&commit(batch, batch as i64, vec![])).unwrap();
    }
    let baseline = db.load_baseline(&table, 3).unwrap();
    assert_eq!(baseline.values(MetricKind::RowCount), &[103.0, 104.0, 105.0]);
}

#[test]
fn test_run_history_round_trip() {
    let db = MetaDb::open_memory().unwrap();
    let now = Utc::now();
    let record = RunRecord {
        run_id: "r1".into(),
        layer: "fact".into(),
        target_table: "fact.claims".into(),
        source: "claims.csv".into(),
        batch_id: Some(3),
        action: Some("proceed".into()),
        phase: "committed".into(),
        rows_inserted: 2,
        rows_updated: 1,
        rows_deleted: 0,
        rows_quarantined: 0,
        warnings: 1,
        error: None,
        started_at: now,
        finished_at: now,
    };
    db.record_run(&record).unwrap();
    let runs = db.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "r1");
    assert_eq!(runs[0].batch_id, Some(3));
    assert_eq!(runs[0].rows_updated, 1);
    assert_eq!(runs[0].warnings, 1);
}

#[test]
fn test_check_advance_without_current() {
    let (source, table) = names();
    assert!(check_advance(None, &source, &table, &at(0), 0).is_ok());
}
