//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use gl_core::{Layer, LockMode, Policy, RunOptions};
use gl_pipeline::{PipelineOrchestrator, RunReport, TableReport, TableStatus};
use std::fmt;
use std::path::PathBuf;

use crate::cli::{GlobalArgs, LayerArg, LockModeArg, PolicyArg, SelectionArgs};

/// Error type representing a non-zero process exit code.
///
/// Use `return Err(ExitCode(N).into())` instead of `std::process::exit(N)`
/// so that destructors (database handles, progress bars) run first.
#[derive(Debug)]
pub(crate) struct ExitCode(pub(crate) i32);

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Control flow only; nothing user-facing to print.
        write!(f, "")
    }
}

impl std::error::Error for ExitCode {}

/// Project directory from the global `--project-dir`.
pub(crate) fn project_root(global: &GlobalArgs) -> PathBuf {
    PathBuf::from(&global.project_dir)
}

/// Load the project and open its target and state databases.
pub(crate) fn load_orchestrator(global: &GlobalArgs) -> Result<PipelineOrchestrator> {
    let root = project_root(global);
    let orchestrator = PipelineOrchestrator::open(&root)
        .with_context(|| format!("Failed to load project at {}", root.display()))?;
    if global.verbose {
        eprintln!(
            "[verbose] Loaded project '{}' ({} tables)",
            orchestrator.config().name,
            orchestrator.config().tables.len()
        );
    }
    Ok(orchestrator)
}

impl From<LayerArg> for Layer {
    fn from(arg: LayerArg) -> Self {
        match arg {
            LayerArg::Staging => Layer::Staging,
            LayerArg::Intermediate => Layer::Intermediate,
            LayerArg::Fact => Layer::Fact,
        }
    }
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Strict => Policy::Strict,
            PolicyArg::Permissive => Policy::Permissive,
        }
    }
}

impl From<LockModeArg> for LockMode {
    fn from(arg: LockModeArg) -> Self {
        match arg {
            LockModeArg::Block => LockMode::Block,
            LockModeArg::FailFast => LockMode::FailFast,
        }
    }
}

/// Split a comma-separated `--tables` value, dropping blanks.
pub(crate) fn parse_tables(tables: Option<&str>) -> Vec<String> {
    tables
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Run options from the shared selection flags.
pub(crate) fn run_options(selection: &SelectionArgs, full_refresh: bool) -> RunOptions {
    RunOptions {
        tables: parse_tables(selection.tables.as_deref()),
        policy: selection.policy.map(Policy::from),
        full_refresh,
        anomaly_threshold: selection.threshold,
        threads: selection.threads,
        ..RunOptions::default()
    }
}

/// One-line summary of a finished table, e.g.
/// `  ✓ fact.claims [committed] +12 ~3 -1 (42ms)`.
pub(crate) fn format_table_line(report: &TableReport) -> String {
    let mark = if report.status.is_success() {
        "\u{2713}"
    } else {
        "\u{2717}"
    };
    let mut line = format!("  {} {} [{}]", mark, report.target, report.status);
    if let Some(outcome) = &report.outcome {
        line.push_str(&format!(
            " +{} ~{} -{}",
            outcome.rows_inserted, outcome.rows_updated, outcome.rows_deleted
        ));
        if outcome.rows_quarantined > 0 {
            line.push_str(&format!(" quarantined {}", outcome.rows_quarantined));
        }
    }
    if report.rows_rejected > 0 {
        line.push_str(&format!(" rejected {}", report.rows_rejected));
    }
    if report.attempts > 1 {
        line.push_str(&format!(" attempts {}", report.attempts));
    }
    line.push_str(&format!(" ({}ms)", report.duration_ms));
    if let Some(error) = &report.error {
        line.push_str(&format!("\n      {}", error));
    }
    line
}

/// Print the end-of-run summary lines.
pub(crate) fn print_summary(report: &RunReport) {
    let succeeded = report
        .tables
        .iter()
        .filter(|t| t.status.is_success())
        .count();
    println!();
    println!(
        "Completed: {} succeeded, {} quarantined, {} failed",
        succeeded,
        report.count(TableStatus::Quarantined),
        report.tables.len() - succeeded - report.count(TableStatus::Quarantined)
    );
    if report.validation_issues > 0 {
        println!(
            "Validation issues: {} (see validation_errors.csv)",
            report.validation_issues
        );
    }
    println!("Total time: {}ms", (report.elapsed_secs * 1000.0) as u64);
}

/// Turn a report into the process result: `Ok` or `ExitCode(3|4)`.
pub(crate) fn exit_with(report: &RunReport) -> Result<()> {
    match report.exit_code() {
        0 => Ok(()),
        code => Err(ExitCode(code).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tables() {
        assert_eq!(
            parse_tables(Some("claims, periods,,")),
            vec!["claims".to_string(), "periods".to_string()]
        );
        assert!(parse_tables(None).is_empty());
    }

    #[test]
    fn test_exit_code_display_is_empty() {
        let err: anyhow::Error = ExitCode(3).into();
        assert_eq!(err.to_string(), "");
        assert_eq!(err.downcast_ref::<ExitCode>().map(|c| c.0), Some(3));
    }

    #[test]
    fn test_format_failed_table_line() {
        let mut report = TableReport::new("claims", "fact.claims", Layer::Fact);
        report.status = TableStatus::Failed;
        report.error = Some("[P001] missing".to_string());
        let line = format_table_line(&report);
        assert!(line.starts_with("  \u{2717} fact.claims [failed]"));
        assert!(line.contains("[P001] missing"));
    }
}
