//! Validate command implementation
//!
//! Runs every stage up to the merge plan without touching targets, state
//! or run history. Exits non-zero when a table would be quarantined or
//! aborted.

use anyhow::Result;
use gl_core::Layer;
use gl_pipeline::{TableReport, TableStatus};

use crate::cli::{GlobalArgs, ValidateArgs};
use crate::commands::common::{self, exit_with, format_table_line, print_summary};

/// Execute the validate command
pub async fn execute(args: &ValidateArgs, global: &GlobalArgs) -> Result<()> {
    let options = common::run_options(&args.selection, args.full_refresh);
    let layer = Layer::from(args.selection.layer);
    let orchestrator = common::load_orchestrator(global)?;

    println!("Validating the {} layer (dry run)\n", layer);
    let report = orchestrator.validate_layer(layer, &options).await?;

    for table in &report.tables {
        println!("{}", format_table_line(table));
        if table.status == TableStatus::Planned {
            print_plan(table, global.verbose);
        }
    }
    print_summary(&report);
    exit_with(&report)
}

fn print_plan(table: &TableReport, verbose: bool) {
    let Some(outcome) = &table.outcome else {
        return;
    };
    let c = &outcome.counts;
    println!(
        "      plan: {} (batch {}): {} insert, {} update, {} no-op, {} duplicate, {} tombstone",
        outcome.action, outcome.batch_id, c.insert, c.update, c.no_op, c.duplicate, c.tombstone
    );
    if let Some(reason) = &outcome.reason {
        println!("      {}", reason);
    }
    for warning in &outcome.warnings {
        println!("      warning: {}", warning);
    }
    if verbose {
        for violation in &outcome.violations {
            eprintln!("[verbose] {}: {}", table.table, violation);
        }
    }
}
