//! Run command implementation

use anyhow::Result;
use gl_core::{Layer, LockMode};
use gl_pipeline::{RunObserver, TableReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::{GlobalArgs, RunArgs};
use crate::commands::common::{self, exit_with, format_table_line, print_summary};

/// Progress bar plus one ✓/✗ line per finished table.
struct ProgressObserver {
    bar: ProgressBar,
    verbose: bool,
}

impl ProgressObserver {
    fn new(len: usize, verbose: bool) -> Self {
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({msg})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar, verbose }
    }
}

impl RunObserver for ProgressObserver {
    fn table_started(&self, table: &str, layer: Layer) {
        self.bar.set_message(format!("Running: {}", table));
        if self.verbose {
            self.bar
                .suspend(|| eprintln!("[verbose] Starting {} ({})", table, layer));
        }
    }

    fn table_finished(&self, report: &TableReport) {
        self.bar.suspend(|| println!("{}", format_table_line(report)));
        self.bar.inc(1);
    }
}

/// Execute the run command
pub async fn execute(args: &RunArgs, global: &GlobalArgs) -> Result<()> {
    let mut options = common::run_options(&args.selection, args.full_refresh);
    options.lock_mode = args.lock_mode.map(LockMode::from);
    options.batch_id = args.batch_id;
    let layer = Layer::from(args.selection.layer);

    let mut orchestrator = common::load_orchestrator(global)?.with_retries(
        args.retries,
        Duration::from_millis(args.retry_backoff_ms),
    );
    let table_count = orchestrator.config().select_tables(&options.tables)?.len();
    let progress = if args.quiet {
        None
    } else {
        let observer = Arc::new(ProgressObserver::new(table_count, global.verbose));
        orchestrator = orchestrator.with_observer(observer.clone());
        Some(observer)
    };

    let cancel = orchestrator.cancel_flag();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted: finishing in-flight merges, skipping the rest");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    if !args.quiet {
        println!(
            "Running {} table(s) into the {} layer{}\n",
            table_count,
            layer,
            if args.full_refresh {
                " (full refresh)"
            } else {
                ""
            }
        );
    }

    let result = orchestrator.run_layer(layer, &options).await;
    signal.abort();
    if let Some(observer) = progress {
        observer.bar.finish_with_message("Complete");
    }
    let report = result?;

    if !args.quiet {
        print_summary(&report);
    }
    if global.verbose {
        eprintln!(
            "[verbose] Wrote {}",
            orchestrator.target_dir().join("run_results.json").display()
        );
    }

    exit_with(&report)
}
