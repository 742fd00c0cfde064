//! Post-commit SQL audits of target tables.
//!
//! Each audit is a query returning the offending rows; zero rows passes.

use gl_core::sql_utils::{quote_ident, quote_qualified};
use gl_core::{Config, Layer, TableConfig};
use gl_db::Database;
use serde::Serialize;
use std::time::{Duration, Instant};

/// What an audit checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    /// The columns form a unique key
    Unique,
    /// No column of the key is null
    NotNull,
    /// Every non-null tuple exists in the parent table
    Relationship {
        parent_table: String,
        parent_columns: Vec<String>,
    },
}

/// One generated audit query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Audit {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub kind: AuditKind,
    pub sql: String,
}

impl Audit {
    pub fn new(table: &str, columns: Vec<String>, kind: AuditKind) -> Self {
        let sql = match &kind {
            AuditKind::Unique => generate_unique_sql(table, &columns),
            AuditKind::NotNull => generate_not_null_sql(table, &columns),
            AuditKind::Relationship {
                parent_table,
                parent_columns,
            } => generate_relationship_sql(table, &columns, parent_table, parent_columns),
        };
        let label = match &kind {
            AuditKind::Unique => "unique".to_string(),
            AuditKind::NotNull => "not_null".to_string(),
            AuditKind::Relationship { parent_table, .. } => format!("relationship_{parent_table}"),
        };
        Self {
            name: format!("{label}_{}__{}", table, columns.join("_")),
            table: table.to_string(),
            columns,
            kind,
            sql,
        }
    }

    /// Grain and foreign-key audits for `table`'s target at `layer`.
    pub fn for_table(config: &Config, table: &TableConfig, layer: Layer) -> Vec<Audit> {
        let target = table.target_for(layer, &config.layers);
        let mut audits = vec![
            Audit::new(&target, table.grain_key.clone(), AuditKind::NotNull),
            Audit::new(&target, table.grain_key.clone(), AuditKind::Unique),
        ];
        for fk in &table.foreign_keys {
            let Some(parent) = config.table(&fk.references) else {
                continue;
            };
            audits.push(Audit::new(
                &target,
                fk.columns.clone(),
                AuditKind::Relationship {
                    parent_table: parent.target_for(layer, &config.layers),
                    parent_columns: TableConfig::parent_columns(fk, parent).to_vec(),
                },
            ));
        }
        audits
    }
}

fn column_list(columns: &[String], prefix: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match prefix {
            Some(p) => format!("{p}.{}", quote_ident(c)),
            None => quote_ident(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Key tuples that appear more than once.
pub fn generate_unique_sql(table: &str, columns: &[String]) -> String {
    let cols = column_list(columns, None);
    format!(
        "SELECT {cols}, COUNT(*) AS cnt\nFROM {}\nGROUP BY {cols}\nHAVING COUNT(*) > 1",
        quote_qualified(table)
    )
}

/// Rows with a null in any of the columns.
pub fn generate_not_null_sql(table: &str, columns: &[String]) -> String {
    let predicate = columns
        .iter()
        .map(|c| format!("{} IS NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("SELECT * FROM {} WHERE {predicate}", quote_qualified(table))
}

/// Non-null tuples with no matching parent row.
pub fn generate_relationship_sql(
    table: &str,
    columns: &[String],
    parent_table: &str,
    parent_columns: &[String],
) -> String {
    let not_null = columns
        .iter()
        .map(|c| format!("src.{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let join = columns
        .iter()
        .zip(parent_columns)
        .map(|(c, p)| format!("ref_tbl.{} = src.{}", quote_ident(p), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT {}\n\
         FROM {} AS src\n\
         WHERE {not_null}\n\
         \x20 AND NOT EXISTS (\n\
         \x20   SELECT 1 FROM {} AS ref_tbl\n\
         \x20   WHERE {join}\n\
         \x20 )",
        column_list(columns, Some("src")),
        quote_qualified(table),
        quote_qualified(parent_table)
    )
}

/// Result of one audit
#[derive(Debug, Clone, Serialize)]
pub struct AuditResult {
    pub name: String,
    pub table: String,
    pub passed: bool,
    /// Number of offending rows (0 if passed)
    pub failure_count: usize,
    /// Up to 5 offending rows as text
    pub sample_failures: Vec<String>,
    #[serde(skip)]
    pub duration: Duration,
    pub error: Option<String>,
}

impl AuditResult {
    fn pass(audit: &Audit, duration: Duration) -> Self {
        Self {
            name: audit.name.clone(),
            table: audit.table.clone(),
            passed: true,
            failure_count: 0,
            sample_failures: Vec::new(),
            duration,
            error: None,
        }
    }

    fn fail(audit: &Audit, failure_count: usize, sample_failures: Vec<String>, duration: Duration) -> Self {
        Self {
            passed: false,
            failure_count,
            sample_failures,
            ..Self::pass(audit, duration)
        }
    }

    fn error(audit: &Audit, error: String, duration: Duration) -> Self {
        Self {
            passed: false,
            error: Some(error),
            ..Self::pass(audit, duration)
        }
    }
}

/// Counts over a set of audit results
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
}

impl AuditSummary {
    pub fn from_results(results: &[AuditResult]) -> Self {
        Self {
            total: results.len(),
            passed: results.iter().filter(|r| r.passed).count(),
            failed: results
                .iter()
                .filter(|r| !r.passed && r.error.is_none())
                .count(),
            errors: results.iter().filter(|r| r.error.is_some()).count(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

/// Runs audits against the target database
pub struct AuditRunner<'a> {
    db: &'a dyn Database,
}

impl<'a> AuditRunner<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    pub async fn run_audit(&self, audit: &Audit) -> AuditResult {
        let start = Instant::now();

        match self.db.query_count(&audit.sql).await {
            Ok(0) => AuditResult::pass(audit, start.elapsed()),
            Ok(count) => {
                let samples = self
                    .db
                    .query_sample_rows(&audit.sql, 5)
                    .await
                    .unwrap_or_default();
                log::warn!("Audit {} failed with {count} row(s)", audit.name);
                AuditResult::fail(audit, count, samples, start.elapsed())
            }
            Err(e) => AuditResult::error(audit, e.to_string(), start.elapsed()),
        }
    }

    pub async fn run_all(&self, audits: &[Audit]) -> (Vec<AuditResult>, AuditSummary) {
        let mut results = Vec::with_capacity(audits.len());
        for audit in audits {
            results.push(self.run_audit(audit).await);
        }
        let summary = AuditSummary::from_results(&results);
        (results, summary)
    }
}

#[cfg(test)]
#[path = "audit_test.rs"]
mod tests;
