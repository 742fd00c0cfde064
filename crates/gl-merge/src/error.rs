//! Error types for gl-merge

use gl_meta::MetaError;
use thiserror::Error;

/// Merge errors
#[derive(Error, Debug)]
pub enum MergeError {
    /// Another run holds a lock on an overlapping partition
    #[error("[G001] Write conflict on {table}: partitions {partitions} are locked by another run")]
    WriteConflict { table: String, partitions: String },

    /// Physical write failed; nothing was mutated
    #[error("[G002] Write to {table} failed: {message}")]
    WriteFailure { table: String, message: String },

    /// Watermark or batch id would move backwards
    #[error("[G003] {0}")]
    Regression(MetaError),

    /// State store failure outside the regression check
    #[error("[G004] State store error: {0}")]
    State(MetaError),

    #[error("[G005] {0}")]
    Core(#[from] gl_core::CoreError),

    #[error("[G006] {0}")]
    Check(#[from] gl_check::CheckError),

    /// Cancelled before execution started
    #[error("[G007] Run for {table} cancelled before execute")]
    Cancelled { table: String },

    /// Quarantine side table could not be written
    #[error("[G008] Quarantine of {table} failed: {message}")]
    QuarantineFailed { table: String, message: String },
}

/// Result type alias for MergeError
pub type MergeResult<T> = Result<T, MergeError>;

impl MergeError {
    /// Conflicts and failed writes can be retried by rerunning the batch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeError::WriteConflict { .. } | MergeError::WriteFailure { .. }
        )
    }

    pub fn is_regression(&self) -> bool {
        matches!(self, MergeError::Regression(_))
    }
}

impl From<MetaError> for MergeError {
    fn from(err: MetaError) -> Self {
        if err.is_regression() {
            MergeError::Regression(err)
        } else {
            MergeError::State(err)
        }
    }
}
