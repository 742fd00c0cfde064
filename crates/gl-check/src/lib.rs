//! gl-check - correctness checks applied between pipeline layers
//!
//! Pure findings ([`GrainValidator`], [`AnomalyDetector`]) that never throw
//! mid-scan, plus SQL audits and quality reports run against committed
//! target tables.

pub mod anomaly;
pub mod audit;
pub mod error;
pub mod grain;
pub mod reports;

pub use anomaly::{AnomalyDetector, AnomalyVerdict, BatchStats, MetricAssessment, MetricStatus};
pub use audit::{Audit, AuditKind, AuditResult, AuditRunner, AuditSummary};
pub use error::{CheckError, CheckResult};
pub use grain::{GrainValidator, GrainVerdict, ParentKeyProvider, Violation, ViolationKind};
pub use reports::{ReportOutput, ReportRunner, RosterSeverity};
