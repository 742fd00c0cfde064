//! Durable state for Grainline.
//!
//! A DuckDB-backed store (`target/meta.duckdb` by default) holding the
//! watermark per (source, table), the key index per target table, rolling
//! anomaly baselines and the run history. The store traits in [`store`] are
//! what the merge engine depends on; [`MetaDb`] implements all of them.

pub mod connection;
pub mod ddl;
pub mod error;
pub mod migration;
pub mod query;
pub(crate) mod row_helpers;
pub mod store;

pub use connection::MetaDb;
pub use error::{MetaError, MetaResult};
pub use query::runs::RunRecord;
pub use store::{
    check_advance, BaselineStore, KeyIndexStore, RunHistoryStore, StateCommit, StateStore,
    WatermarkStore,
};
