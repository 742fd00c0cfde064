//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Grainline - incremental merges and data-quality checks for layered tables
#[derive(Parser, Debug)]
#[command(name = "grainline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to project directory (containing grainline.yml)
    #[arg(
        short = 'p',
        long,
        global = true,
        default_value = ".",
        env = "GRAINLINE_PROJECT_DIR"
    )]
    pub project_dir: String,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Merge new source batches into a layer
    Run(RunArgs),

    /// Dry run: stage, validate and plan without writing
    Validate(ValidateArgs),

    /// Show watermarks, key counts and recent runs
    Status(StatusArgs),

    /// Export quality reports (coverage gaps, cost spikes, roster mismatch)
    Report(ReportArgs),
}

/// Target layer of a run
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerArg {
    Staging,
    Intermediate,
    Fact,
}

/// Referential-violation policy override
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyArg {
    /// Quarantine the batch
    Strict,
    /// Drop offending rows and proceed with warnings
    Permissive,
}

/// Partition lock behaviour override
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockModeArg {
    /// Wait for the current holder
    Block,
    /// Fail immediately with a write conflict
    FailFast,
}

/// Options shared by `run` and `validate`
#[derive(Args, Debug, Clone)]
pub struct SelectionArgs {
    /// Layer to build
    #[arg(short, long, value_enum, default_value = "fact")]
    pub layer: LayerArg,

    /// Table names to run (comma-separated, default: all)
    #[arg(short, long)]
    pub tables: Option<String>,

    /// Override the configured policy
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Override the anomaly threshold
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Override the configured thread count
    #[arg(long)]
    pub threads: Option<usize>,
}

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Ignore watermarks and rebuild targets from the full source
    #[arg(long)]
    pub full_refresh: bool,

    /// Partition lock behaviour
    #[arg(long, value_enum)]
    pub lock_mode: Option<LockModeArg>,

    /// Explicit batch id (default: last committed id + 1)
    #[arg(long)]
    pub batch_id: Option<u64>,

    /// Retry a table this many times on write conflicts or write failures
    #[arg(long, default_value = "0")]
    pub retries: u32,

    /// Base delay between retries in milliseconds (multiplied by attempt)
    #[arg(long, default_value = "1000")]
    pub retry_backoff_ms: u64,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the validate command
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Plan as a full refresh
    #[arg(long)]
    pub full_refresh: bool,
}

/// Output formats for status
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable tables
    Text,
    /// JSON output
    Json,
}

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Number of recent run records to show
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the report command
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Output directory (default: the project's target directory)
    #[arg(short, long)]
    pub out_dir: Option<String>,
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;
