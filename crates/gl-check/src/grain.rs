//! GrainValidator: one row per key, referential integrity, temporal sanity.

use crate::error::{CheckError, CheckResult};
use gl_core::{
    BusinessKey, Config, CoreError, Layer, RecordBatch, TableConfig, TableName, Value,
};
use gl_meta::{KeyIndexStore, MetaDb};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Live keys of parent tables, used for referential checks.
pub trait ParentKeyProvider: Send + Sync {
    /// The subset of `keys` that exist live in `parent`.
    fn live_keys(
        &self,
        parent: &TableName,
        keys: &[&BusinessKey],
    ) -> CheckResult<HashSet<BusinessKey>>;
}

impl ParentKeyProvider for MetaDb {
    fn live_keys(
        &self,
        parent: &TableName,
        keys: &[&BusinessKey],
    ) -> CheckResult<HashSet<BusinessKey>> {
        self.live_keys_among(parent, keys)
            .map_err(|e| CheckError::ParentLookup {
                table: parent.to_string(),
                message: e.to_string(),
            })
    }
}

/// Fixed parent key sets, for dry runs and tests.
impl ParentKeyProvider for HashMap<TableName, HashSet<BusinessKey>> {
    fn live_keys(
        &self,
        parent: &TableName,
        keys: &[&BusinessKey],
    ) -> CheckResult<HashSet<BusinessKey>> {
        let Some(known) = self.get(parent) else {
            return Ok(HashSet::new());
        };
        Ok(keys
            .iter()
            .filter(|k| known.contains(**k))
            .map(|k| (*k).clone())
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Grain key not unique after duplicate exclusion
    Grain,
    /// Null component in the grain key
    NullKey,
    /// Foreign key without a live parent
    Orphan,
    /// Declared ordering between two columns does not hold
    Temporal,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Grain => "grain",
            ViolationKind::NullKey => "null_key",
            ViolationKind::Orphan => "orphan",
            ViolationKind::Temporal => "temporal",
        }
    }

    /// Grain and null-key violations abort the merge.
    pub fn is_grain(&self) -> bool {
        matches!(self, ViolationKind::Grain | ViolationKind::NullKey)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding against one row (or one key).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Row index within the validated batch
    pub row: Option<usize>,
    pub source_line: Option<u64>,
    pub key: Option<String>,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(line) = self.source_line {
            write!(f, " (line {line})")?;
        }
        if let Some(key) = &self.key {
            write!(f, " [{key}]")?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Result of grain validation: `ok` when there are no violations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrainVerdict {
    pub violations: Vec<Violation>,
}

impl GrainVerdict {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn of_kind(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn has_grain_violations(&self) -> bool {
        self.violations.iter().any(|v| v.kind.is_grain())
    }

    /// Row indices with at least one orphaned foreign key
    pub fn orphan_rows(&self) -> BTreeSet<usize> {
        self.of_kind(ViolationKind::Orphan)
            .filter_map(|v| v.row)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct ForeignKeyCheck {
    columns: Vec<String>,
    parent: TableName,
}

#[derive(Debug, Clone)]
struct TemporalCheck {
    start: String,
    end: String,
}

/// Validates a batch against its target grain.
///
/// Pure: reads parent keys through the provider and never mutates state.
#[derive(Debug, Clone)]
pub struct GrainValidator {
    grain_key: Vec<String>,
    foreign_keys: Vec<ForeignKeyCheck>,
    temporal: Vec<TemporalCheck>,
}

impl GrainValidator {
    pub fn new(grain_key: Vec<String>) -> Self {
        Self {
            grain_key,
            foreign_keys: Vec::new(),
            temporal: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, columns: Vec<String>, parent: TableName) -> Self {
        self.foreign_keys.push(ForeignKeyCheck { columns, parent });
        self
    }

    pub fn with_temporal(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.temporal.push(TemporalCheck {
            start: start.into(),
            end: end.into(),
        });
        self
    }

    /// Validator for `table` at `layer`; parents resolve to the same layer.
    pub fn for_table(config: &Config, table: &TableConfig, layer: Layer) -> CheckResult<Self> {
        let mut validator = Self::new(table.grain_key.clone());
        for fk in &table.foreign_keys {
            let parent = config
                .table(&fk.references)
                .ok_or_else(|| CoreError::TableNotFound {
                    name: fk.references.clone(),
                })?;
            let target = TableName::parse(parent.target_for(layer, &config.layers))?;
            validator = validator.with_foreign_key(fk.columns.clone(), target);
        }
        for rule in &table.temporal {
            validator = validator.with_temporal(rule.start.clone(), rule.end.clone());
        }
        Ok(validator)
    }

    pub fn grain_key(&self) -> &[String] {
        &self.grain_key
    }

    /// Check, in order, grain uniqueness, foreign keys and temporal rules.
    ///
    /// Rows in `excluded` (classified as duplicates) are skipped entirely.
    pub fn validate(
        &self,
        batch: &RecordBatch,
        excluded: &HashSet<usize>,
        parents: &dyn ParentKeyProvider,
    ) -> CheckResult<GrainVerdict> {
        let schema = batch.schema();
        for col in self
            .grain_key
            .iter()
            .chain(self.foreign_keys.iter().flat_map(|fk| fk.columns.iter()))
            .chain(self.temporal.iter().flat_map(|t| [&t.start, &t.end]))
        {
            schema.require(col)?;
        }

        let mut verdict = GrainVerdict::default();
        self.check_grain(batch, excluded, &mut verdict)?;
        for fk in &self.foreign_keys {
            self.check_foreign_key(batch, excluded, fk, parents, &mut verdict)?;
        }
        for rule in &self.temporal {
            check_temporal(batch, excluded, rule, &mut verdict);
        }

        if !verdict.is_ok() {
            log::debug!(
                "Grain validation found {} violation(s) in batch {} of {}",
                verdict.violations.len(),
                batch.batch_id(),
                batch.source_file()
            );
        }
        Ok(verdict)
    }

    fn check_grain(
        &self,
        batch: &RecordBatch,
        excluded: &HashSet<usize>,
        verdict: &mut GrainVerdict,
    ) -> CheckResult<()> {
        let mut seen: BTreeMap<BusinessKey, Vec<usize>> = BTreeMap::new();
        for row in batch.iter().filter(|r| !excluded.contains(&r.index())) {
            match BusinessKey::from_row(&row, self.grain_key.as_slice())? {
                Some(key) => seen.entry(key).or_default().push(row.index()),
                None => verdict.violations.push(Violation {
                    kind: ViolationKind::NullKey,
                    row: Some(row.index()),
                    source_line: row.provenance().source_line,
                    key: None,
                    detail: format!("null value in grain key ({})", self.grain_key.join(", ")),
                }),
            }
        }
        for (key, rows) in seen.into_iter().filter(|(_, rows)| rows.len() > 1) {
            for &index in &rows[1..] {
                verdict.violations.push(Violation {
                    kind: ViolationKind::Grain,
                    row: Some(index),
                    source_line: batch.row(index).and_then(|r| r.provenance().source_line),
                    key: Some(key.to_string()),
                    detail: format!("key appears {} times after duplicate exclusion", rows.len()),
                });
            }
        }
        Ok(())
    }

    fn check_foreign_key(
        &self,
        batch: &RecordBatch,
        excluded: &HashSet<usize>,
        fk: &ForeignKeyCheck,
        parents: &dyn ParentKeyProvider,
        verdict: &mut GrainVerdict,
    ) -> CheckResult<()> {
        let mut candidates: Vec<(usize, Option<BusinessKey>)> = Vec::new();
        for row in batch.iter().filter(|r| !excluded.contains(&r.index())) {
            let values: Vec<&Value> = fk
                .columns
                .iter()
                .filter_map(|c| row.get(c))
                .collect();
            if values.iter().all(|v| v.is_null()) {
                continue;
            }
            candidates.push((row.index(), BusinessKey::from_values(values)));
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let distinct: BTreeSet<&BusinessKey> =
            candidates.iter().filter_map(|(_, k)| k.as_ref()).collect();
        let lookup: Vec<&BusinessKey> = distinct.into_iter().collect();
        let live = parents.live_keys(&fk.parent, &lookup)?;

        for (index, key) in candidates {
            let detail = match &key {
                Some(k) if live.contains(k) => continue,
                Some(_) => format!("no live parent in {}", fk.parent),
                None => format!("partially null foreign key to {}", fk.parent),
            };
            verdict.violations.push(Violation {
                kind: ViolationKind::Orphan,
                row: Some(index),
                source_line: batch.row(index).and_then(|r| r.provenance().source_line),
                key: key.map(|k| k.to_string()),
                detail: format!("({}) {detail}", fk.columns.join(", ")),
            });
        }
        Ok(())
    }
}

fn check_temporal(
    batch: &RecordBatch,
    excluded: &HashSet<usize>,
    rule: &TemporalCheck,
    verdict: &mut GrainVerdict,
) {
    for row in batch.iter().filter(|r| !excluded.contains(&r.index())) {
        let (Some(start), Some(end)) = (row.get(&rule.start), row.get(&rule.end)) else {
            continue;
        };
        if start.is_null() || end.is_null() {
            continue;
        }
        let detail = match start.partial_cmp(end) {
            Some(Ordering::Greater) => format!("{} {start} is after {} {end}", rule.start, rule.end),
            None => format!("{} and {} are not comparable", rule.start, rule.end),
            _ => continue,
        };
        verdict.violations.push(Violation {
            kind: ViolationKind::Temporal,
            row: Some(row.index()),
            source_line: row.provenance().source_line,
            key: None,
            detail,
        });
    }
}

#[cfg(test)]
#[path = "grain_test.rs"]
mod tests;
