//! Source readers: produce raw batches bounded by a watermark.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use gl_core::{
    BatchMeta, BatchSchema, ColumnType, Layer, RecordBatch, Row, SourceName, Value,
    WatermarkValue,
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// What to read and from where.
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub source: &'a SourceName,
    /// Rows below this value were merged by an earlier batch
    pub since: &'a WatermarkValue,
    pub watermark_column: &'a str,
    pub watermark_type: ColumnType,
    pub batch_id: u64,
}

/// Connector producing raw (all-text) batches.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, request: &ReadRequest<'_>) -> PipelineResult<RecordBatch>;
}

/// Reads header-driven CSV files relative to a project root.
///
/// Keeps rows whose watermark value is `>=` the high-water value, so the
/// boundary is re-read, and rows whose watermark cell does not parse, so
/// staging can reject them explicitly.
#[derive(Debug, Clone)]
pub struct CsvSourceReader {
    root: PathBuf,
    delimiter: u8,
}

impl CsvSourceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn read_sync(&self, request: &ReadRequest<'_>) -> PipelineResult<RecordBatch> {
        let path = self.root.join(request.source.as_str());
        let file = File::open(&path).map_err(|e| PipelineError::SourceRead {
            source_name: request.source.to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let schema = Arc::new(BatchSchema::text(&headers)?);
        let wm_pos = schema.require(request.watermark_column)?;

        let meta = BatchMeta::new(request.source.as_str(), request.batch_id, Layer::Raw);
        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let admitted = match record.get(wm_pos).map(|c| request.watermark_type.coerce(c)) {
                Some(Ok(value)) => request.since.admits(&value),
                _ => true,
            };
            if !admitted {
                skipped += 1;
                continue;
            }
            let values = record
                .iter()
                .map(|cell| Value::Text(cell.to_string()))
                .collect();
            rows.push(Row::new(values, meta.provenance(Some(line as u64 + 1))));
        }
        log::debug!(
            "{}: read {} row(s), {} below watermark {}",
            request.source,
            rows.len(),
            skipped,
            request.since
        );
        Ok(RecordBatch::new(meta, schema, rows)?)
    }
}

#[async_trait]
impl SourceReader for CsvSourceReader {
    async fn read(&self, request: &ReadRequest<'_>) -> PipelineResult<RecordBatch> {
        self.read_sync(request)
    }
}
