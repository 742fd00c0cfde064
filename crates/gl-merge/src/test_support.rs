//! Claim-batch fixtures for the merge tests.

use crate::classify::KeyIndex;
use crate::plan::{MergePlan, MergeTarget};
use crate::planner::MergePlanner;
use chrono::Duration;
use gl_check::{AnomalyDetector, BatchStats, GrainValidator};
use gl_core::{
    AnomalyBaseline, AnomalyStrategy, BatchMeta, BatchSchema, BusinessKey, ColumnDef, ColumnType,
    Layer, Policy, Provenance, RecordBatch, Row, SourceName, TableName, Value,
};
use gl_meta::{KeyIndexStore, MetaDb};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// (claim_id, amount, month, updated_at, deleted)
pub type Claim<'a> = (Option<&'a str>, i64, &'a str, i64, bool);

pub fn columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("claim_id", ColumnType::Text),
        ColumnDef::new("amount", ColumnType::Integer),
        ColumnDef::new("month", ColumnType::Text),
        ColumnDef::new("updated_at", ColumnType::Integer),
        ColumnDef::new("deleted", ColumnType::Boolean),
    ]
}

pub fn table() -> TableName {
    TableName::parse("fact.claims").unwrap()
}

pub fn source() -> SourceName {
    SourceName::parse("claims.csv").unwrap()
}

fn values(claim: &Claim<'_>) -> Vec<Value> {
    let (id, amount, month, updated, deleted) = *claim;
    vec![
        id.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
        Value::Int(amount),
        Value::Text(month.to_string()),
        Value::Int(updated),
        Value::Bool(deleted),
    ]
}

/// Rows ingested `offsets[i]` seconds after the batch.
pub fn batch_at(batch_id: u64, claims: &[Claim<'_>], offsets: &[i64]) -> RecordBatch {
    let schema = Arc::new(BatchSchema::new(columns()).unwrap());
    let meta = BatchMeta::new("claims.csv", batch_id, Layer::Fact);
    let rows = claims
        .iter()
        .enumerate()
        .map(|(i, claim)| {
            let offset = offsets.get(i).copied().unwrap_or(0);
            Row::new(
                values(claim),
                Provenance {
                    source_line: Some(i as u64 + 1),
                    ingested_at: meta.ingested_at + Duration::seconds(offset),
                },
            )
        })
        .collect();
    RecordBatch::new(meta, schema, rows).unwrap()
}

pub fn batch(batch_id: u64, claims: &[Claim<'_>]) -> RecordBatch {
    batch_at(batch_id, claims, &[])
}

pub fn key_index(store: &dyn KeyIndexStore) -> KeyIndex<'_> {
    KeyIndex::new(
        store,
        table(),
        vec!["claim_id".into()],
        vec!["amount".into(), "month".into()],
    )
    .with_partition_column(Some("month".into()))
    .with_delete_flag(Some("deleted".into()))
}

pub fn target() -> MergeTarget {
    MergeTarget {
        table: table(),
        source: source(),
        columns: columns(),
        key_columns: vec!["claim_id".into()],
        partition_column: Some("month".into()),
        watermark_column: "updated_at".into(),
    }
}

pub fn periods() -> TableName {
    TableName::parse("fact.periods").unwrap()
}

/// Inputs to a planning run.
#[derive(Default)]
pub struct Scenario<'a> {
    pub policy: Policy,
    pub full_refresh: bool,
    pub baseline: AnomalyBaseline,
    /// Live parent months; `None` skips the foreign-key check
    pub periods: Option<&'a [&'a str]>,
}

/// Classify, validate, assess and plan `batch` against `db`.
pub fn plan_batch(db: &MetaDb, batch: RecordBatch, scenario: &Scenario<'_>) -> MergePlan {
    let classified = key_index(db)
        .classify(batch, scenario.full_refresh)
        .unwrap();

    let mut validator = GrainValidator::new(vec!["claim_id".into()]);
    let mut parents: HashMap<TableName, HashSet<BusinessKey>> = HashMap::new();
    if let Some(months) = scenario.periods {
        validator = validator.with_foreign_key(vec!["month".into()], periods());
        parents.insert(
            periods(),
            months
                .iter()
                .map(|m| BusinessKey::from_values([&Value::Text(m.to_string())]).unwrap())
                .collect(),
        );
    }
    let grain = validator
        .validate(&classified.batch, &classified.duplicates(), &parents)
        .unwrap();

    let stats = BatchStats::collect(
        &classified.batch,
        &["claim_id".to_string()],
        Some("month"),
        &classified.unchanged(),
        &grain.orphan_rows(),
    )
    .unwrap();
    let anomaly =
        AnomalyDetector::new(AnomalyStrategy::Zscore, 3.0).assess(&stats, &scenario.baseline);

    MergePlanner::new(table(), scenario.policy).plan(classified, grain, anomaly, stats)
}
