//! Staging layer: standardize raw text batches into typed batches.
//!
//! Cells are trimmed and coerced to the declared column types. A coercion
//! failure rejects the row; a pattern-rule mismatch tags it and keeps it.
//! Every finding is recorded as a [`StagingIssue`].

use crate::error::{PipelineError, PipelineResult};
use gl_core::config::FillForwardRule;
use gl_core::{BatchSchema, ColumnDef, Layer, RecordBatch, Row, TableConfig, Value};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One staging finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagingIssue {
    pub table: String,
    pub source_line: Option<u64>,
    pub column: String,
    pub value: String,
    pub reason: String,
    /// Rejected rows are dropped; tagged rows are kept
    pub rejected: bool,
}

/// Typed batch plus the findings produced while standardizing it.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub batch: RecordBatch,
    pub issues: Vec<StagingIssue>,
}

impl StagedBatch {
    /// Rows dropped by coercion failures
    pub fn rejected_rows(&self) -> usize {
        let mut lines: Vec<Option<u64>> = self
            .issues
            .iter()
            .filter(|i| i.rejected)
            .map(|i| i.source_line)
            .collect();
        lines.sort();
        lines.dedup();
        lines.len()
    }

    /// Rows kept with at least one pattern issue
    pub fn tagged_rows(&self) -> usize {
        let mut lines: Vec<Option<u64>> = self
            .issues
            .iter()
            .filter(|i| !i.rejected)
            .map(|i| i.source_line)
            .collect();
        lines.sort();
        lines.dedup();
        lines.len()
    }
}

#[derive(Debug, Clone)]
struct PatternCheck {
    column: String,
    pattern: Regex,
    message: String,
}

/// Staging transform for one table.
#[derive(Debug, Clone)]
pub struct Stager {
    table: String,
    columns: Vec<ColumnDef>,
    patterns: Vec<PatternCheck>,
    fill_forward: Vec<FillForwardRule>,
}

impl Stager {
    pub fn for_table(table: &TableConfig) -> PipelineResult<Self> {
        let patterns = table
            .rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    PipelineError::Core(gl_core::CoreError::ConfigInvalid {
                        message: format!("invalid pattern for '{}': {e}", rule.column),
                    })
                })?;
                Ok(PatternCheck {
                    column: rule.column.clone(),
                    pattern,
                    message: rule
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("{} does not match {}", rule.column, rule.pattern)),
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        Ok(Self {
            table: table.name.clone(),
            columns: table.columns.clone(),
            patterns,
            fill_forward: table.fill_forward.clone(),
        })
    }

    /// Standardize a raw batch.
    pub fn stage(&self, raw: &RecordBatch) -> PipelineResult<StagedBatch> {
        let raw_schema = raw.schema();
        for col in &self.columns {
            raw_schema.require(&col.name)?;
        }
        let schema = Arc::new(BatchSchema::new(self.columns.clone())?);

        let mut issues = Vec::new();
        let mut rows = Vec::with_capacity(raw.len());
        for row in raw.iter() {
            let line = row.provenance().source_line;
            let mut values = Vec::with_capacity(self.columns.len());
            let mut rejected = false;
            for col in &self.columns {
                let cell = match row.get(&col.name) {
                    Some(Value::Text(s)) => s.as_str(),
                    Some(Value::Null) | None => "",
                    Some(other) => {
                        values.push(other.clone());
                        continue;
                    }
                };
                match col.column_type.coerce(cell) {
                    Ok(value) => values.push(value),
                    Err(e) => {
                        rejected = true;
                        issues.push(StagingIssue {
                            table: self.table.clone(),
                            source_line: line,
                            column: col.name.clone(),
                            value: cell.trim().to_string(),
                            reason: e.to_string(),
                            rejected: true,
                        });
                        values.push(Value::Null);
                    }
                }
            }
            if rejected {
                continue;
            }
            for check in &self.patterns {
                let Some(pos) = schema.position(&check.column) else {
                    continue;
                };
                if let Value::Text(s) = &values[pos] {
                    if !check.pattern.is_match(s) {
                        issues.push(StagingIssue {
                            table: self.table.clone(),
                            source_line: line,
                            column: check.column.clone(),
                            value: s.clone(),
                            reason: check.message.clone(),
                            rejected: false,
                        });
                    }
                }
            }
            rows.push(Row::new(values, row.provenance().clone()));
        }

        for rule in &self.fill_forward {
            fill_forward(&schema, &mut rows, rule)?;
        }

        if rows.len() < raw.len() {
            log::warn!(
                "{}: staging rejected {} row(s) of {}",
                self.table,
                raw.len() - rows.len(),
                raw.len()
            );
        }
        let batch = raw.derive(Layer::Staging, schema, rows)?;
        Ok(StagedBatch { batch, issues })
    }
}

/// Fill nulls of `rule.column` within each `partition_by` group: forward
/// from the previous value, then backward for a group's leading nulls.
fn fill_forward(schema: &BatchSchema, rows: &mut [Row], rule: &FillForwardRule) -> PipelineResult<()> {
    let target = schema.require(&rule.column)?;
    let group_positions = rule
        .partition_by
        .iter()
        .map(|c| schema.require(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let key = group_positions
            .iter()
            .map(|&p| row.values()[p].canonical())
            .collect();
        groups.entry(key).or_default().push(idx);
    }

    let mut updates: Vec<(usize, Value)> = Vec::new();
    for members in groups.values() {
        let mut filled: Vec<Value> = members
            .iter()
            .map(|&i| rows[i].values()[target].clone())
            .collect();
        let mut last: Option<Value> = None;
        for value in filled.iter_mut() {
            if value.is_null() {
                if let Some(prev) = &last {
                    *value = prev.clone();
                }
            } else {
                last = Some(value.clone());
            }
        }
        if let Some(first) = filled.iter().find(|v| !v.is_null()).cloned() {
            for value in filled.iter_mut().take_while(|v| v.is_null()) {
                *value = first.clone();
            }
        }
        for (&i, value) in members.iter().zip(filled) {
            if rows[i].values()[target].is_null() && !value.is_null() {
                updates.push((i, value));
            }
        }
    }

    for (i, value) in updates {
        let (mut values, provenance) = rows[i].clone().into_parts();
        values[target] = value;
        rows[i] = Row::new(values, provenance);
    }
    Ok(())
}

/// Write staging issues as CSV, replacing any previous file.
pub fn write_validation_errors(path: &Path, issues: &[StagingIssue]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::Io {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["table", "source_line", "column", "value", "reason", "action"])?;
    for issue in issues {
        let line = issue.source_line.map(|l| l.to_string()).unwrap_or_default();
        writer.write_record([
            issue.table.as_str(),
            line.as_str(),
            issue.column.as_str(),
            issue.value.as_str(),
            issue.reason.as_str(),
            if issue.rejected { "rejected" } else { "tagged" },
        ])?;
    }
    writer.flush().map_err(|e| PipelineError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
#[path = "staging_test.rs"]
mod tests;
