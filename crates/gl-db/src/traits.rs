//! Database trait definition

use crate::error::DbResult;
use crate::write::{QuarantineRow, WriteOutcome, WriteSet};
use async_trait::async_trait;
use gl_core::ColumnDef;
use std::path::Path;

/// Target warehouse used by the merge executor, audits and reports.
///
/// Implementations must be Send + Sync; one backend is shared by every
/// table merging concurrently.
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute SQL that modifies data, returns affected rows
    async fn execute(&self, sql: &str) -> DbResult<usize>;

    /// Execute multiple SQL statements
    async fn execute_batch(&self, sql: &str) -> DbResult<()>;

    /// Row count of a query
    async fn query_count(&self, sql: &str) -> DbResult<usize>;

    /// First column of the first row as text
    async fn query_one(&self, sql: &str) -> DbResult<Option<String>>;

    /// Up to `limit` rows, each rendered as comma-separated text
    async fn query_sample_rows(&self, sql: &str, limit: usize) -> DbResult<Vec<String>>;

    /// Check if a table or view exists
    async fn relation_exists(&self, name: &str) -> DbResult<bool>;

    /// Create a schema if it does not exist
    async fn create_schema_if_not_exists(&self, schema: &str) -> DbResult<()>;

    /// Drop a table if it exists
    async fn drop_if_exists(&self, name: &str) -> DbResult<()>;

    /// Create the table (and its schema) if missing, adding any columns
    /// the existing table lacks
    async fn ensure_table(&self, name: &str, columns: &[ColumnDef]) -> DbResult<()>;

    /// Apply a merge write set atomically: everything or nothing
    async fn apply_writes(&self, writes: &WriteSet) -> DbResult<WriteOutcome>;

    /// Append rows to the quarantine side table of `table`
    async fn write_quarantine(&self, table: &str, rows: &[QuarantineRow]) -> DbResult<usize>;

    /// Export a query result as CSV with a header row, returns rows written
    async fn export_csv(&self, sql: &str, path: &Path) -> DbResult<usize>;

    /// Database type identifier for logging
    fn db_type(&self) -> &'static str;
}

/// Name of the quarantine side table for a target table.
pub fn quarantine_table_name(table: &str) -> String {
    format!("{table}__quarantine")
}
