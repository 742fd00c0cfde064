//! gl-pipeline - layered pipeline runs for Grainline
//!
//! Reads source batches through a [`SourceReader`], standardizes them in the
//! staging layer, derives and enriches columns in the intermediate layer,
//! and hands the result to the merge engine. [`PipelineOrchestrator`] runs a
//! layer for every selected table in foreign-key order and returns a
//! [`RunReport`].

pub mod enrichment;
pub mod error;
pub mod intermediate;
pub mod orchestrator;
pub mod report;
pub mod source;
pub mod staging;

pub use enrichment::{
    derive_key, single_match, CachedEnrichment, EnrichmentProvider, EnrichmentRecord,
    JsonEnrichmentProvider, LookupTable,
};
pub use error::{PipelineError, PipelineResult};
pub use intermediate::IntermediateLayer;
pub use orchestrator::{NoopObserver, PipelineOrchestrator, RunObserver};
pub use report::{RunReport, TableReport, TableStatus};
pub use source::{CsvSourceReader, ReadRequest, SourceReader};
pub use staging::{write_validation_errors, StagedBatch, Stager, StagingIssue};
