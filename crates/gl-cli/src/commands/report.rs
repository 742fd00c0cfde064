//! Report command implementation

use anyhow::{Context, Result};
use gl_check::ReportRunner;
use std::path::PathBuf;

use crate::cli::{GlobalArgs, ReportArgs};
use crate::commands::common::{self, project_root};

/// Execute the report command
pub async fn execute(args: &ReportArgs, global: &GlobalArgs) -> Result<()> {
    let orchestrator = common::load_orchestrator(global)?;
    let out_dir = match &args.out_dir {
        Some(dir) => PathBuf::from(dir),
        None => orchestrator
            .config()
            .target_path_absolute(&project_root(global)),
    };

    log::debug!("Exporting reports to {}", out_dir.display());
    let runner = ReportRunner::new(orchestrator.db().as_ref(), orchestrator.config());
    let outputs = runner
        .run(&out_dir)
        .await
        .context("Failed to export reports")?;

    if outputs.is_empty() {
        println!("No reports configured (add a `reports:` section to grainline.yml)");
        return Ok(());
    }
    for output in &outputs {
        println!(
            "  \u{2713} {} ({} rows) -> {}",
            output.name,
            output.rows,
            output.path.display()
        );
    }
    println!("\nExported {} report(s)", outputs.len());
    Ok(())
}
