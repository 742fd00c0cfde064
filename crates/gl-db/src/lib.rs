//! gl-db - Target storage for Grainline
//!
//! The `Database` trait covers everything the merge engine needs from the
//! warehouse: partition-scoped upserts and deletes in one transaction, a
//! quarantine side table, and small query helpers for audits and reports.

pub mod duckdb;
pub mod error;
pub mod traits;
pub mod write;

pub use crate::duckdb::DuckDbBackend;
pub use error::{DbError, DbResult};
pub use traits::Database;
pub use write::{QuarantineRow, WriteOutcome, WriteSet};
