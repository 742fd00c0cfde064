//! Error types for the meta database.

use thiserror::Error;

/// Meta database errors.
#[derive(Error, Debug)]
pub enum MetaError {
    /// Failed to open or create the meta database (M001).
    #[error("[M001] Meta database connection failed: {0}")]
    ConnectionError(String),

    /// Schema migration failed (M002).
    #[error("[M002] Meta database migration failed: {0}")]
    MigrationError(String),

    /// SQL execution error inside the meta database (M003).
    #[error("[M003] Meta database query failed: {0}")]
    QueryError(String),

    /// Transaction management error (M004).
    #[error("[M004] Meta database transaction failed: {0}")]
    TransactionError(String),

    /// Mutex guarding the connection was poisoned (M005).
    #[error("[M005] Meta database mutex poisoned: {0}")]
    MutexPoisoned(String),

    /// A stored value could not be decoded (M006).
    #[error("[M006] Corrupt state in {table}: {message}")]
    CorruptState { table: String, message: String },

    /// DuckDB driver error with preserved source chain (M007).
    #[error("[M007] DuckDB error")]
    DuckDb(#[source] duckdb::Error),

    /// Watermark would move backwards outside a full refresh (M008).
    #[error(
        "[M008] Watermark regression for {source_name} -> {table}: {attempted} is before {current}"
    )]
    WatermarkRegression {
        source_name: String,
        table: String,
        current: String,
        attempted: String,
    },

    /// Batch id would move backwards (M009).
    #[error(
        "[M009] Batch regression for {source_name} -> {table}: batch {attempted} is before {last}"
    )]
    BatchRegression {
        source_name: String,
        table: String,
        last: u64,
        attempted: u64,
    },
}

impl MetaError {
    /// Whether this is a watermark or batch-id regression
    pub fn is_regression(&self) -> bool {
        matches!(
            self,
            MetaError::WatermarkRegression { .. } | MetaError::BatchRegression { .. }
        )
    }
}

/// Result type alias for [`MetaError`].
pub type MetaResult<T> = Result<T, MetaError>;

impl From<duckdb::Error> for MetaError {
    fn from(err: duckdb::Error) -> Self {
        MetaError::DuckDb(err)
    }
}
