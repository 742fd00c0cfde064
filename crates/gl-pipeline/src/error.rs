//! Error types for gl-pipeline

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Source file missing or unreadable
    #[error("[P001] Cannot read source '{source_name}': {message}")]
    SourceRead {
        source_name: String,
        message: String,
    },

    #[error("[P002] CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Provider failed transiently; the caching wrapper retries these
    #[error("[P003] Enrichment lookup for '{key}' failed: {message}")]
    EnrichmentUnavailable { key: String, message: String },

    /// One key resolved to several records
    #[error("[P004] Enrichment key '{key}' matched {matches} records; expected at most one")]
    EnrichmentFanOut { key: String, matches: usize },

    /// Lookup or enrichment file is malformed
    #[error("[P005] Invalid lookup '{name}': {message}")]
    InvalidLookup { name: String, message: String },

    #[error("[P006] {0}")]
    Core(#[from] gl_core::CoreError),

    #[error("[P007] {0}")]
    Db(#[from] gl_db::DbError),

    #[error("[P008] {0}")]
    Meta(#[from] gl_meta::MetaError),

    #[error("[P009] {0}")]
    Check(#[from] gl_check::CheckError),

    #[error("[P010] {0}")]
    Merge(#[from] gl_merge::MergeError),

    /// Cancellation flag observed between stages
    #[error("[P011] Run for {table} cancelled")]
    Cancelled { table: String },

    #[error("[P012] Failed to write '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("[P013] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Table task panicked before producing a report
    #[error("[P014] Run for {table} stopped unexpectedly: {message}")]
    TaskFailed { table: String, message: String },
}

/// Result type alias for PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Write conflicts and failed writes can be retried by rerunning the table.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Merge(e) if e.is_retryable())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}
