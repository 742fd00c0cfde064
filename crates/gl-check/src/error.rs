//! Error types for gl-check

use thiserror::Error;

/// Check errors. Findings are not errors; these are failures to check.
#[derive(Error, Debug)]
pub enum CheckError {
    /// Core error (unknown column, bad batch)
    #[error("[C001] {0}")]
    Core(#[from] gl_core::CoreError),

    /// Target database error while auditing or reporting
    #[error("[C002] {0}")]
    Db(#[from] gl_db::DbError),

    /// Non-finite or out-of-range threshold
    #[error("[C003] Invalid threshold: {0}")]
    InvalidThreshold(String),

    /// Parent key lookup failed
    #[error("[C004] Parent key lookup failed for '{table}': {message}")]
    ParentLookup { table: String, message: String },

    /// Report definition cannot be turned into SQL
    #[error("[C005] Invalid report '{name}': {message}")]
    InvalidReport { name: String, message: String },
}

/// Result type alias for CheckError
pub type CheckResult<T> = Result<T, CheckError>;
