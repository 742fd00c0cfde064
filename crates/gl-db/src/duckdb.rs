//! DuckDB database backend implementation

use crate::error::{DbError, DbResult};
use crate::traits::{quarantine_table_name, Database};
use crate::write::{QuarantineRow, WriteOutcome, WriteSet};
use async_trait::async_trait;
use duckdb::types::Value as SqlValue;
use duckdb::{params, params_from_iter, Connection};
use gl_core::sql_utils::{
    escape_sql_string, quote_column_list, quote_ident, quote_qualified,
    split_qualified_name,
};
use gl_core::{ColumnDef, ColumnType, PartitionSet, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const QUARANTINE_COLUMNS: &str = "run_id VARCHAR, batch_id BIGINT, source_file VARCHAR, \
     row_json VARCHAR, reason VARCHAR, quarantined_at TIMESTAMP";

/// DuckDB database backend
pub struct DuckDbBackend {
    conn: Mutex<Connection>,
}

impl DuckDbBackend {
    /// Create a new in-memory DuckDB connection
    pub fn in_memory() -> DbResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) a DuckDB file, creating parent directories
    pub fn from_path(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::ConnectionError(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create from path string (handles :memory: special case)
    pub fn new(path: &str) -> DbResult<Self> {
        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::from_path(Path::new(path))
        }
    }

    fn lock_conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))
    }

    fn execute_sync(&self, sql: &str) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        conn.execute(sql, [])
            .map_err(|e| DbError::ExecutionError(format!("{e}: {sql}")))
    }

    fn execute_batch_sync(&self, sql: &str) -> DbResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql).map_err(DbError::from)
    }

    fn query_count_sync(&self, sql: &str) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        count_rows(&conn, sql)
    }

    fn query_rows_sync(&self, sql: &str, limit: Option<usize>) -> DbResult<Vec<Vec<Option<String>>>> {
        let conn = self.lock_conn()?;
        query_text_rows(&conn, sql, limit)
    }

    fn relation_exists_sync(&self, name: &str) -> DbResult<bool> {
        let conn = self.lock_conn()?;
        relation_exists_with(&conn, name)
    }

    fn ensure_table_sync(&self, name: &str, columns: &[ColumnDef]) -> DbResult<()> {
        let conn = self.lock_conn()?;
        ensure_table_with(&conn, name, columns)
    }

    fn apply_writes_sync(&self, writes: &WriteSet) -> DbResult<WriteOutcome> {
        if writes.is_noop() {
            return Ok(WriteOutcome::default());
        }
        let invalid = |message: String| DbError::InvalidWrite {
            table: writes.table.clone(),
            message,
        };
        let key_positions = writes
            .key_positions()
            .ok_or_else(|| invalid("key column missing from write columns".into()))?;
        if let Some(row) = writes.upserts.iter().find(|r| r.len() != writes.columns.len()) {
            return Err(invalid(format!(
                "upsert row has {} values for {} columns",
                row.len(),
                writes.columns.len()
            )));
        }
        if writes
            .deletes
            .iter()
            .any(|k| k.len() != writes.key_columns.len())
        {
            return Err(invalid("delete key width does not match key columns".into()));
        }

        let conn = self.lock_conn()?;
        in_transaction(&conn, |conn| write_rows(conn, writes, &key_positions)).map_err(|e| {
            DbError::WriteFailed {
                table: writes.table.clone(),
                message: e.to_string(),
            }
        })
    }

    fn write_quarantine_sync(&self, table: &str, rows: &[QuarantineRow]) -> DbResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let side_table = quarantine_table_name(table);
        let conn = self.lock_conn()?;
        create_schema_for(&conn, &side_table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({QUARANTINE_COLUMNS})",
            quote_qualified(&side_table)
        ))?;
        in_transaction(&conn, |conn| {
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {} VALUES (?, ?, ?, ?, ?, CAST(? AS TIMESTAMP))",
                quote_qualified(&side_table)
            ))?;
            let mut written = 0;
            for row in rows {
                written += stmt.execute(params![
                    row.run_id,
                    i64::try_from(row.batch_id).unwrap_or(i64::MAX),
                    row.source_file,
                    row.row_json,
                    row.reason,
                    row.quarantined_at.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                ])?;
            }
            Ok(written)
        })
    }

    fn export_csv_sync(&self, sql: &str, path: &Path) -> DbResult<usize> {
        let export_err = |message: String| DbError::ExportFailed {
            path: path.display().to_string(),
            message,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| export_err(e.to_string()))?;
        }
        let conn = self.lock_conn()?;
        let count = count_rows(&conn, sql)?;
        conn.execute_batch(&format!(
            "COPY ({sql}) TO '{}' (HEADER, DELIMITER ',')",
            escape_sql_string(&path.display().to_string())
        ))
        .map_err(|e| export_err(e.to_string()))?;
        Ok(count)
    }
}

/// Run `f` between BEGIN and COMMIT, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> DbResult<T>,
) -> DbResult<T> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                log::warn!("Rollback failed after '{e}': {rollback}");
            }
            Err(e)
        }
    }
}

fn count_rows(conn: &Connection, sql: &str) -> DbResult<usize> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM ({sql}) AS counted"), [], |row| {
            row.get(0)
        })
        .map_err(DbError::from)?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Every column of every row rendered as text by DuckDB itself.
fn query_text_rows(
    conn: &Connection,
    sql: &str,
    limit: Option<usize>,
) -> DbResult<Vec<Vec<Option<String>>>> {
    let wrapped = format!("SELECT CAST(COLUMNS(*) AS VARCHAR) FROM ({sql}) AS q");
    let mut stmt = conn.prepare(&wrapped)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if limit.is_some_and(|l| out.len() >= l) {
            break;
        }
        let width = row.as_ref().column_count();
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(row.get::<_, Option<String>>(idx)?);
        }
        out.push(values);
    }
    Ok(out)
}

fn relation_exists_with(conn: &Connection, name: &str) -> DbResult<bool> {
    let (schema, table) = split_qualified_name(name);
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
        params![schema, table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn create_schema_for(conn: &Connection, table: &str) -> DbResult<()> {
    let (schema, _) = split_qualified_name(table);
    if schema != "main" {
        conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_qualified(schema)
        ))?;
    }
    Ok(())
}

fn ensure_table_with(conn: &Connection, name: &str, columns: &[ColumnDef]) -> DbResult<()> {
    create_schema_for(conn, name)?;
    let table = quote_qualified(name);
    let defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        defs.join(", ")
    ))?;
    for def in defs {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {def}"))?;
    }
    Ok(())
}

fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Boolean(*b),
        Value::Int(i) => SqlValue::BigInt(*i),
        Value::Float(f) => SqlValue::Double(*f),
        other => SqlValue::Text(other.canonical()),
    }
}

fn column_type(writes: &WriteSet, name: &str) -> DbResult<ColumnType> {
    writes
        .columns
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.column_type)
        .ok_or_else(|| DbError::InvalidWrite {
            table: writes.table.clone(),
            message: format!("column '{name}' is not part of the write"),
        })
}

fn cast_placeholder(ty: ColumnType) -> String {
    format!("CAST(? AS {})", ty.sql_type())
}

/// WHERE fragment restricting a statement to the write's partitions.
fn partition_scope(writes: &WriteSet) -> DbResult<(String, Vec<SqlValue>)> {
    let (values, column) = match (&writes.partitions, &writes.partition_column) {
        (PartitionSet::Values(values), Some(column)) => (values, column),
        _ => return Ok(("TRUE".to_string(), Vec::new())),
    };
    let ty = column_type(writes, column)?;
    let quoted = quote_ident(column);
    let present: Vec<&String> = values.iter().flatten().collect();
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if !present.is_empty() {
        let casts = vec![cast_placeholder(ty); present.len()];
        clauses.push(format!("{quoted} IN ({})", casts.join(", ")));
        params.extend(present.into_iter().map(|v| SqlValue::Text(v.clone())));
    }
    if values.contains(&None) {
        clauses.push(format!("{quoted} IS NULL"));
    }
    if clauses.is_empty() {
        return Ok(("FALSE".to_string(), Vec::new()));
    }
    Ok((format!("({})", clauses.join(" OR ")), params))
}

fn write_rows(conn: &Connection, writes: &WriteSet, key_positions: &[usize]) -> DbResult<WriteOutcome> {
    let table = quote_qualified(&writes.table);
    let mut outcome = WriteOutcome::default();

    if writes.truncate {
        outcome.rows_deleted = conn.execute(&format!("DELETE FROM {table}"), [])?;
    } else {
        let (scope, scope_params) = partition_scope(writes)?;
        let mut key_clauses = Vec::with_capacity(writes.key_columns.len());
        for key in &writes.key_columns {
            key_clauses.push(format!(
                "{} = {}",
                quote_ident(key),
                cast_placeholder(column_type(writes, key)?)
            ));
        }
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM {table} WHERE {scope} AND {}",
            key_clauses.join(" AND ")
        ))?;
        let upsert_keys = writes
            .upserts
            .iter()
            .map(|row| key_positions.iter().map(|&i| &row[i]).collect::<Vec<_>>());
        let delete_keys = writes.deletes.iter().map(|k| k.iter().collect::<Vec<_>>());
        for key in upsert_keys.chain(delete_keys) {
            let params = scope_params
                .iter()
                .cloned()
                .chain(key.into_iter().map(bind_value));
            outcome.rows_deleted += stmt.execute(params_from_iter(params))?;
        }
    }

    if !writes.upserts.is_empty() {
        let names: Vec<&str> = writes.columns.iter().map(|c| c.name.as_str()).collect();
        let casts: Vec<String> = writes
            .columns
            .iter()
            .map(|c| cast_placeholder(c.column_type))
            .collect();
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            quote_column_list(&names),
            casts.join(", ")
        ))?;
        for row in &writes.upserts {
            outcome.rows_inserted += stmt.execute(params_from_iter(row.iter().map(bind_value)))?;
        }
    }
    log::debug!(
        "{}: deleted {} and inserted {} rows in partitions {}",
        writes.table,
        outcome.rows_deleted,
        outcome.rows_inserted,
        writes.partitions
    );
    Ok(outcome)
}

#[async_trait]
impl Database for DuckDbBackend {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        self.execute_sync(sql)
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.execute_batch_sync(sql)
    }

    async fn query_count(&self, sql: &str) -> DbResult<usize> {
        self.query_count_sync(sql)
    }

    async fn query_one(&self, sql: &str) -> DbResult<Option<String>> {
        let rows = self.query_rows_sync(sql, Some(1))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }

    async fn query_sample_rows(&self, sql: &str, limit: usize) -> DbResult<Vec<String>> {
        let rows = self.query_rows_sync(sql, Some(limit))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|v| v.unwrap_or_else(|| "NULL".to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .collect())
    }

    async fn relation_exists(&self, name: &str) -> DbResult<bool> {
        self.relation_exists_sync(name)
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> DbResult<()> {
        self.execute_batch_sync(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(schema)
        ))
    }

    async fn drop_if_exists(&self, name: &str) -> DbResult<()> {
        self.execute_batch_sync(&format!("DROP TABLE IF EXISTS {}", quote_qualified(name)))
    }

    async fn ensure_table(&self, name: &str, columns: &[ColumnDef]) -> DbResult<()> {
        self.ensure_table_sync(name, columns)
    }

    async fn apply_writes(&self, writes: &WriteSet) -> DbResult<WriteOutcome> {
        self.apply_writes_sync(writes)
    }

    async fn write_quarantine(&self, table: &str, rows: &[QuarantineRow]) -> DbResult<usize> {
        self.write_quarantine_sync(table, rows)
    }

    async fn export_csv(&self, sql: &str, path: &Path) -> DbResult<usize> {
        self.export_csv_sync(sql, path)
    }

    fn db_type(&self) -> &'static str {
        "duckdb"
    }
}

#[cfg(test)]
#[path = "duckdb_test.rs"]
mod tests;
