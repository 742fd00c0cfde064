//! gl-core - Core library for Grainline
//!
//! Shared types used by every Grainline crate: typed values and record
//! batches, business keys and change fingerprints, watermark and key-index
//! state, anomaly baselines, project configuration and the foreign-key DAG
//! that orders table merges.

pub mod baseline;
pub mod batch;
pub mod checksum;
pub mod config;
pub mod dag;
pub mod error;
pub mod key;
pub mod names;
mod newtype_string;
pub mod partition;
pub mod sql_utils;
pub mod state;
pub mod value;

pub use baseline::{AnomalyBaseline, MetricKind};
pub use batch::{BatchMeta, BatchSchema, ColumnDef, Layer, Provenance, RecordBatch, Row, RowRef};
pub use checksum::compute_checksum;
pub use config::{
    AnomalyConfig, AnomalyStrategy, Config, ForeignKeyConfig, LockMode, Policy, RunOptions,
    TableConfig,
};
pub use dag::TableDag;
pub use error::{CoreError, CoreResult};
pub use key::{BusinessKey, Fingerprint};
pub use names::{SourceName, TableName};
pub use partition::{PartitionSet, PartitionValue};
pub use state::{KeyEntry, Watermark, WatermarkValue};
pub use value::{ColumnType, Value};
