//! Immutable record batches.
//!
//! A [`RecordBatch`] is the unit that flows between pipeline layers. It owns
//! its rows, never changes after construction, and every transformation
//! produces a new batch through [`RecordBatch::derive`].

use crate::error::{CoreError, CoreResult};
use crate::value::{ColumnType, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Pipeline layer a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Untyped reader output, every cell is text
    Raw,
    Staging,
    Intermediate,
    Fact,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Raw => "raw",
            Layer::Staging => "staging",
            Layer::Intermediate => "intermediate",
            Layer::Fact => "fact",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Layer::Raw),
            "staging" => Ok(Layer::Staging),
            "intermediate" => Ok(Layer::Intermediate),
            "fact" => Ok(Layer::Fact),
            other => Err(CoreError::ConfigInvalid {
                message: format!(
                    "unknown layer '{other}' (expected raw, staging, intermediate or fact)"
                ),
            }),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: ColumnType,
}

fn default_column_type() -> ColumnType {
    ColumnType::Text
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column layout shared by every row of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSchema {
    columns: Vec<ColumnDef>,
    positions: HashMap<String, usize>,
}

impl BatchSchema {
    pub fn new(columns: Vec<ColumnDef>) -> CoreResult<Self> {
        let mut positions = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            if col.name.is_empty() {
                return Err(CoreError::EmptyName {
                    context: "column name".into(),
                });
            }
            if positions.insert(col.name.clone(), idx).is_some() {
                return Err(CoreError::DuplicateColumn {
                    column: col.name.clone(),
                });
            }
        }
        Ok(Self { columns, positions })
    }

    /// Schema of text columns, as produced by readers.
    pub fn text<S: AsRef<str>>(names: &[S]) -> CoreResult<Self> {
        Self::new(
            names
                .iter()
                .map(|n| ColumnDef::new(n.as_ref(), ColumnType::Text))
                .collect(),
        )
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.position(name).map(|i| self.columns[i].column_type)
    }

    /// Position of `name`, or [`CoreError::UnknownColumn`].
    pub fn require(&self, name: &str) -> CoreResult<usize> {
        self.position(name).ok_or_else(|| CoreError::UnknownColumn {
            column: name.to_string(),
        })
    }
}

/// Where a row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    /// 1-based line in the source file, header excluded
    pub source_line: Option<u64>,
    /// Defaults to the batch's ingestion time; drives duplicate tie-breaks
    pub ingested_at: DateTime<Utc>,
}

/// One row: values in schema order plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    provenance: Provenance,
}

impl Row {
    pub fn new(values: Vec<Value>, provenance: Provenance) -> Self {
        Self { values, provenance }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn into_parts(self) -> (Vec<Value>, Provenance) {
        (self.values, self.provenance)
    }
}

/// Batch-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMeta {
    pub source_file: String,
    /// Monotonic per source
    pub batch_id: u64,
    pub ingested_at: DateTime<Utc>,
    pub layer: Layer,
}

impl BatchMeta {
    pub fn new(source_file: impl Into<String>, batch_id: u64, layer: Layer) -> Self {
        Self {
            source_file: source_file.into(),
            batch_id,
            ingested_at: Utc::now(),
            layer,
        }
    }

    /// Provenance for a row without its own ingestion time.
    pub fn provenance(&self, source_line: Option<u64>) -> Provenance {
        Provenance {
            source_line,
            ingested_at: self.ingested_at,
        }
    }
}

/// Immutable typed chunk of rows.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    meta: BatchMeta,
    schema: Arc<BatchSchema>,
    rows: Arc<[Row]>,
}

impl RecordBatch {
    /// Build a batch, checking every row against the schema width.
    pub fn new(meta: BatchMeta, schema: Arc<BatchSchema>, rows: Vec<Row>) -> CoreResult<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.values.len() != schema.len() {
                return Err(CoreError::RowArity {
                    row: idx,
                    expected: schema.len(),
                    found: row.values.len(),
                });
            }
        }
        Ok(Self {
            meta,
            schema,
            rows: rows.into(),
        })
    }

    /// A new batch for the next layer, keeping source, batch id and ingestion time.
    pub fn derive(
        &self,
        layer: Layer,
        schema: Arc<BatchSchema>,
        rows: Vec<Row>,
    ) -> CoreResult<Self> {
        let meta = BatchMeta {
            layer,
            ..self.meta.clone()
        };
        Self::new(meta, schema, rows)
    }

    /// A batch holding only the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let rows: Vec<Row> = indices
            .iter()
            .filter_map(|&i| self.rows.get(i).cloned())
            .collect();
        Self {
            meta: self.meta.clone(),
            schema: Arc::clone(&self.schema),
            rows: rows.into(),
        }
    }

    pub fn meta(&self) -> &BatchMeta {
        &self.meta
    }

    pub fn source_file(&self) -> &str {
        &self.meta.source_file
    }

    pub fn batch_id(&self) -> u64 {
        self.meta.batch_id
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.meta.ingested_at
    }

    pub fn layer(&self) -> Layer {
        self.meta.layer
    }

    pub fn schema(&self) -> &Arc<BatchSchema> {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|row| RowRef {
            schema: &self.schema,
            row,
            index,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().enumerate().map(|(index, row)| RowRef {
            schema: &self.schema,
            row,
            index,
        })
    }

    /// Values of one column across all rows.
    pub fn column(&self, name: &str) -> CoreResult<impl Iterator<Item = &Value>> {
        let pos = self.schema.require(name)?;
        Ok(self.rows.iter().map(move |r| &r.values[pos]))
    }
}

/// Borrowed view of one row with by-name access.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    schema: &'a BatchSchema,
    row: &'a Row,
    index: usize,
}

impl<'a> RowRef<'a> {
    /// Position of the row in its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.schema.position(column).map(|i| &self.row.values[i])
    }

    pub fn values(&self) -> &'a [Value] {
        &self.row.values
    }

    pub fn provenance(&self) -> &'a Provenance {
        &self.row.provenance
    }

    pub fn row(&self) -> &'a Row {
        self.row
    }

    /// Column name to JSON value, in schema order.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .schema
            .names()
            .zip(self.row.values.iter())
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod tests;
