//! Status command implementation

use anyhow::{Context, Result};
use gl_core::{Config, Watermark};
use gl_meta::{KeyIndexStore, MetaDb, RunHistoryStore, RunRecord, WatermarkStore};
use serde::Serialize;

use crate::cli::{GlobalArgs, OutputFormat, StatusArgs};
use crate::commands::common::project_root;

#[derive(Debug, Serialize)]
struct TargetState {
    #[serde(flatten)]
    watermark: Watermark,
    live_keys: usize,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    project: String,
    targets: Vec<TargetState>,
    recent_runs: Vec<RunRecord>,
}

/// Execute the status command
pub async fn execute(args: &StatusArgs, global: &GlobalArgs) -> Result<()> {
    let root = project_root(global);
    let config = Config::load_from_dir(&root)
        .with_context(|| format!("Failed to load project at {}", root.display()))?;
    let meta_path = config.meta_path_absolute(&root);
    if global.verbose {
        eprintln!("[verbose] Reading state from {}", meta_path.display());
    }
    let meta = MetaDb::open(&meta_path).context("Failed to open state database")?;

    let mut targets = Vec::new();
    for watermark in meta.list_watermarks()? {
        let live_keys = meta.live_key_count(&watermark.table)?;
        targets.push(TargetState {
            watermark,
            live_keys,
        });
    }
    let output = StatusOutput {
        project: config.name.clone(),
        targets,
        recent_runs: meta.recent_runs(args.limit)?,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => print_text(&output),
    }
    Ok(())
}

fn print_text(output: &StatusOutput) {
    println!("Project: {}\n", output.project);
    if output.targets.is_empty() {
        println!("No committed watermarks yet.");
    } else {
        println!(
            "{:<28} {:<28} {:>8} {:>10}  {:<24} UPDATED",
            "TARGET", "SOURCE", "BATCH", "LIVE KEYS", "WATERMARK"
        );
        for t in &output.targets {
            println!(
                "{:<28} {:<28} {:>8} {:>10}  {:<24} {}",
                t.watermark.table.as_str(),
                t.watermark.source.as_str(),
                t.watermark.last_batch_id,
                t.live_keys,
                t.watermark.high_water_value.to_string(),
                t.watermark.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if output.recent_runs.is_empty() {
        return;
    }
    println!("\nRecent runs:");
    for run in &output.recent_runs {
        let batch = run
            .batch_id
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<28} batch {:<6} {:<12} +{} ~{} -{} q{}{}",
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
            run.target_table,
            batch,
            run.phase,
            run.rows_inserted,
            run.rows_updated,
            run.rows_deleted,
            run.rows_quarantined,
            run.error
                .as_ref()
                .map(|e| format!("  {}", e))
                .unwrap_or_default()
        );
    }
}
