//! Run report: one entry per table, serialized to `run_results.json`.

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use gl_check::{AuditResult, AuditSummary};
use gl_core::Layer;
use gl_merge::{MergeAction, MergeOutcome, RunPhase};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Final state of one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Committed,
    Quarantined,
    Aborted,
    /// Error outside the merge decision (read, staging, write, state)
    Failed,
    Cancelled,
    /// Dry run: planned but not executed
    Planned,
    /// Nothing new past the watermark
    UpToDate,
}

impl TableStatus {
    pub fn from_phase(phase: RunPhase) -> Self {
        match phase {
            RunPhase::Planned => TableStatus::Planned,
            RunPhase::Committed => TableStatus::Committed,
            RunPhase::Quarantined => TableStatus::Quarantined,
            RunPhase::Aborted => TableStatus::Aborted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Committed => "committed",
            TableStatus::Quarantined => "quarantined",
            TableStatus::Aborted => "aborted",
            TableStatus::Failed => "failed",
            TableStatus::Cancelled => "cancelled",
            TableStatus::Planned => "planned",
            TableStatus::UpToDate => "up_to_date",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TableStatus::Committed | TableStatus::Planned | TableStatus::UpToDate
        )
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    /// Qualified target, e.g. `fact.claims`
    pub target: String,
    pub layer: Layer,
    pub status: TableStatus,
    pub attempts: u32,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub rows_tagged: usize,
    pub outcome: Option<MergeOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audits: Vec<AuditResult>,
    pub audit_summary: Option<AuditSummary>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TableReport {
    pub fn new(table: &str, target: &str, layer: Layer) -> Self {
        Self {
            table: table.to_string(),
            target: target.to_string(),
            layer,
            status: TableStatus::Planned,
            attempts: 1,
            rows_read: 0,
            rows_rejected: 0,
            rows_tagged: 0,
            outcome: None,
            audits: Vec::new(),
            audit_summary: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Report for a table whose run ended in an error.
    pub fn failed(mut self, error: &PipelineError) -> Self {
        self.status = if error.is_cancelled() {
            TableStatus::Cancelled
        } else {
            TableStatus::Failed
        };
        self.error = Some(error.to_string());
        self
    }

    pub fn with_outcome(mut self, outcome: MergeOutcome) -> Self {
        self.status = TableStatus::from_phase(outcome.phase);
        if let Some(reason) = &outcome.reason {
            if !self.status.is_success() {
                self.error = Some(reason.clone());
            }
        }
        self.outcome = Some(outcome);
        self
    }

    /// Status used for the exit code; a dry run counts as its planned action.
    fn effective_status(&self) -> TableStatus {
        match (&self.status, &self.outcome) {
            (TableStatus::Planned, Some(outcome)) => match outcome.action {
                MergeAction::Abort => TableStatus::Aborted,
                MergeAction::Quarantine => TableStatus::Quarantined,
                MergeAction::Proceed | MergeAction::ProceedWithWarning => TableStatus::Planned,
            },
            (status, _) => *status,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.outcome.as_ref().map(|o| o.rows_written()).unwrap_or(0)
    }
}

/// Result of one `run_layer` (or dry-run) invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub layer: Layer,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub tables: Vec<TableReport>,
    /// Staging issues across all tables, also written to `validation_errors.csv`
    pub validation_issues: usize,
}

impl RunReport {
    pub fn count(&self, status: TableStatus) -> usize {
        self.tables
            .iter()
            .filter(|t| t.effective_status() == status)
            .count()
    }

    /// 0 when every table succeeded, 3 if any was quarantined, 4 if any was
    /// aborted, failed or cancelled.
    pub fn exit_code(&self) -> i32 {
        let statuses: Vec<TableStatus> = self.tables.iter().map(|t| t.effective_status()).collect();
        if statuses.iter().any(|s| {
            matches!(
                s,
                TableStatus::Aborted | TableStatus::Failed | TableStatus::Cancelled
            )
        }) {
            4
        } else if statuses.contains(&TableStatus::Quarantined) {
            3
        } else {
            0
        }
    }

    pub fn write_json(&self, path: &Path) -> PipelineResult<()> {
        let io_err = |e: std::io::Error| PipelineError::Io {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(io_err)
    }
}
