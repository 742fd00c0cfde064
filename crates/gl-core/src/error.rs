//! Error types for gl-core

use thiserror::Error;

/// Core error type for Grainline
#[derive(Error, Debug)]
pub enum CoreError {
    /// E001: Configuration file not found
    #[error("[E001] Config file not found: {path}")]
    ConfigNotFound { path: String },

    /// E002: Invalid configuration value
    #[error("[E002] Invalid config: {message}")]
    ConfigInvalid { message: String },

    /// E003: Table is not declared in the project config
    #[error("[E003] Table not configured: {name}")]
    TableNotFound { name: String },

    /// E004: Foreign keys form a cycle
    #[error("[E004] Circular foreign-key dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// E005: Column missing from a batch schema
    #[error("[E005] Column '{column}' is not part of the batch schema")]
    UnknownColumn { column: String },

    /// E006: Column declared twice in one schema
    #[error("[E006] Duplicate column '{column}' in batch schema")]
    DuplicateColumn { column: String },

    /// E007: Row width does not match the schema
    #[error("[E007] Row {row} has {found} values but the schema declares {expected} columns")]
    RowArity {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// E008: A text cell cannot be coerced to the declared type
    #[error("[E008] Cannot read '{value}' as {target}")]
    Coercion { value: String, target: String },

    /// E009: Empty identifier where a name is required
    #[error("[E009] Empty name: {context}")]
    EmptyName { context: String },

    /// E010: IO error
    #[error("[E010] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// E011: IO error with file path context
    #[error("[E011] Failed to read '{path}': {source}")]
    IoWithPath {
        path: String,
        source: std::io::Error,
    },

    /// E012: YAML parse error
    #[error("[E012] Config parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for CoreError
pub type CoreResult<T> = Result<T, CoreError>;
