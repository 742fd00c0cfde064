//! PipelineOrchestrator: runs one layer for a set of tables.
//!
//! Tables are ordered by the foreign-key DAG. Tables on the same level run
//! concurrently, bounded by a semaphore; each table runs its stages in
//! sequence (read, stage, intermediate, classify, validate, assess, plan,
//! execute). The cancel flag is checked between stages and never inside
//! `execute`.

use crate::error::{PipelineError, PipelineResult};
use crate::intermediate::IntermediateLayer;
use crate::report::{RunReport, TableReport, TableStatus};
use crate::source::{CsvSourceReader, ReadRequest, SourceReader};
use crate::staging::{write_validation_errors, StagingIssue, Stager};
use chrono::Utc;
use gl_check::{AnomalyDetector, Audit, AuditRunner, BatchStats, GrainValidator};
use gl_core::{ColumnType, Config, CoreError, Layer, RunOptions, TableConfig, WatermarkValue};
use gl_db::{Database, DuckDbBackend};
use gl_merge::{
    KeyIndex, MergeExecutor, MergeOutcome, MergePlanner, MergeTarget, PartitionLocks,
};
use gl_meta::{BaselineStore, MetaDb, RunHistoryStore, RunRecord, WatermarkStore};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinError;

/// Per-table progress callbacks, used by the CLI for progress output.
pub trait RunObserver: Send + Sync {
    fn table_started(&self, _table: &str, _layer: Layer) {}
    fn table_finished(&self, _report: &TableReport) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// One table's report plus the staging issues it produced.
struct TableRun {
    report: TableReport,
    issues: Vec<StagingIssue>,
}

/// Sequences staging, intermediate and fact merges for a project.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    root: Arc<PathBuf>,
    db: Arc<dyn Database>,
    meta: Arc<MetaDb>,
    reader: Arc<dyn SourceReader>,
    intermediate: Arc<IntermediateLayer>,
    locks: Arc<PartitionLocks>,
    cancel: Arc<AtomicBool>,
    observer: Arc<dyn RunObserver>,
    retries: u32,
    retry_backoff: Duration,
}

impl PipelineOrchestrator {
    /// Orchestrator over explicit stores; sources are CSV files under `root`.
    pub fn new(
        config: Config,
        root: impl Into<PathBuf>,
        db: Arc<dyn Database>,
        meta: Arc<MetaDb>,
    ) -> PipelineResult<Self> {
        let root = root.into();
        let intermediate = IntermediateLayer::from_config(&config, &root)?;
        Ok(Self {
            reader: Arc::new(CsvSourceReader::new(root.clone())),
            config: Arc::new(config),
            root: Arc::new(root),
            db,
            meta,
            intermediate: Arc::new(intermediate),
            locks: PartitionLocks::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            observer: Arc::new(NoopObserver),
            retries: 0,
            retry_backoff: Duration::from_secs(1),
        })
    }

    /// Load `grainline.yml` from `root` and open the configured databases.
    pub fn open(root: &Path) -> PipelineResult<Self> {
        let config = Config::load_from_dir(root)?;
        let db: Arc<dyn Database> = match config.database_path_absolute(root) {
            Some(path) => Arc::new(DuckDbBackend::from_path(&path)?),
            None => Arc::new(DuckDbBackend::in_memory()?),
        };
        let meta = Arc::new(MetaDb::open(&config.meta_path_absolute(root))?);
        Self::new(config, root, db, meta)
    }

    pub fn with_reader(mut self, reader: Arc<dyn SourceReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_intermediate(mut self, intermediate: IntermediateLayer) -> Self {
        self.intermediate = Arc::new(intermediate);
        self
    }

    /// Rerun a table up to `retries` more times on retryable errors,
    /// waiting `attempt * backoff` between attempts.
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shared flag; setting it cancels tables that have not reached execute.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn meta(&self) -> &Arc<MetaDb> {
        &self.meta
    }

    pub fn target_dir(&self) -> PathBuf {
        self.config.target_path_absolute(&self.root)
    }

    /// Merge every selected table into its target at `layer`.
    ///
    /// Writes `run_results.json` and `validation_errors.csv` to the target
    /// directory and appends one run history record per table.
    pub async fn run_layer(&self, layer: Layer, options: &RunOptions) -> PipelineResult<RunReport> {
        let report = self.run(layer, options, false).await?;
        report.write_json(&self.target_dir().join("run_results.json"))?;
        Ok(report)
    }

    /// Dry run: read, stage, validate, assess and plan without writing
    /// targets or state.
    pub async fn validate_layer(
        &self,
        layer: Layer,
        options: &RunOptions,
    ) -> PipelineResult<RunReport> {
        self.run(layer, options, true).await
    }

    async fn run(&self, layer: Layer, options: &RunOptions, dry_run: bool) -> PipelineResult<RunReport> {
        if layer == Layer::Raw {
            return Err(CoreError::ConfigInvalid {
                message: "the raw layer has no merge target".to_string(),
            }
            .into());
        }
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        self.intermediate.begin_run();

        let selected: HashSet<String> = self
            .config
            .select_tables(&options.tables)?
            .into_iter()
            .map(|t| t.name.clone())
            .collect();
        let levels: Vec<Vec<String>> = self
            .config
            .dag()?
            .levels()?
            .into_iter()
            .map(|level| level.into_iter().filter(|n| selected.contains(n)).collect())
            .filter(|level: &Vec<String>| !level.is_empty())
            .collect();
        let threads = options.effective_threads(&self.config);
        log::info!(
            "Run {run_id}: {} table(s) at the {layer} layer ({} level(s), {threads} thread(s){})",
            selected.len(),
            levels.len(),
            if dry_run { ", dry run" } else { "" }
        );

        let semaphore = Arc::new(Semaphore::new(threads));
        let mut runs: Vec<TableRun> = Vec::with_capacity(selected.len());
        for level in levels {
            let mut handles = Vec::with_capacity(level.len());
            for name in level {
                let task_name = name.clone();
                let this = self.clone();
                let semaphore = Arc::clone(&semaphore);
                let options = options.clone();
                let run_id = run_id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            let cancelled = PipelineError::Cancelled {
                                table: name.clone(),
                            };
                            return this.failed_run(&name, layer, &cancelled);
                        }
                    };
                    this.run_table_with_retry(&name, layer, &options, &run_id, dry_run)
                        .await
                });
                handles.push((task_name, handle));
            }
            for (name, handle) in handles {
                match handle.await {
                    Ok(run) => runs.push(run),
                    Err(e) => runs.push(self.lost_run(&name, layer, &run_id, dry_run, e)),
                }
            }
        }

        let issues: Vec<StagingIssue> = runs.iter().flat_map(|r| r.issues.clone()).collect();
        write_validation_errors(&self.target_dir().join("validation_errors.csv"), &issues)?;

        let report = RunReport {
            run_id,
            layer,
            dry_run,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: start.elapsed().as_secs_f64(),
            tables: runs.into_iter().map(|r| r.report).collect(),
            validation_issues: issues.len(),
        };
        log::info!(
            "Run {} finished in {:.2}s: {} committed, {} quarantined, {} aborted, {} failed",
            report.run_id,
            report.elapsed_secs,
            report.count(TableStatus::Committed),
            report.count(TableStatus::Quarantined),
            report.count(TableStatus::Aborted),
            report.count(TableStatus::Failed)
        );
        Ok(report)
    }

    async fn run_table_with_retry(
        &self,
        name: &str,
        layer: Layer,
        options: &RunOptions,
        run_id: &str,
        dry_run: bool,
    ) -> TableRun {
        self.observer.table_started(name, layer);
        let start = Instant::now();
        let started_at = Utc::now();
        let mut attempt = 1u32;
        let mut run = loop {
            match self.run_table(name, layer, options, run_id, dry_run).await {
                Ok(run) => break run,
                Err(e) if e.is_retryable() && attempt <= self.retries => {
                    let wait = self.retry_backoff * attempt;
                    log::warn!(
                        "{name}: attempt {attempt} failed: {e}; retrying in {}ms",
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("{name}: {e}");
                    break self.failed_run(name, layer, &e);
                }
            }
        };
        run.report.attempts = attempt;
        run.report.duration_ms = start.elapsed().as_millis() as u64;

        if !dry_run && run.report.status != TableStatus::UpToDate {
            self.record_history(name, run_id, &run.report, started_at);
        }
        self.observer.table_finished(&run.report);
        run
    }

    fn failed_run(&self, name: &str, layer: Layer, error: &PipelineError) -> TableRun {
        let target = self
            .config
            .table(name)
            .map(|t| t.target_for(layer, &self.config.layers))
            .unwrap_or_default();
        TableRun {
            report: TableReport::new(name, &target, layer).failed(error),
            issues: Vec::new(),
        }
    }

    /// Failed run for a table whose task panicked or was aborted.
    fn lost_run(
        &self,
        name: &str,
        layer: Layer,
        run_id: &str,
        dry_run: bool,
        error: JoinError,
    ) -> TableRun {
        let message = if error.is_panic() {
            let payload = error.into_panic();
            payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string())
        } else {
            error.to_string()
        };
        let error = PipelineError::TaskFailed {
            table: name.to_string(),
            message,
        };
        log::error!("{name}: {error}");
        let run = self.failed_run(name, layer, &error);
        if !dry_run {
            self.record_history(name, run_id, &run.report, Utc::now());
        }
        self.observer.table_finished(&run.report);
        run
    }

    fn check_cancelled(&self, table: &str) -> PipelineResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    async fn run_table(
        &self,
        name: &str,
        layer: Layer,
        options: &RunOptions,
        run_id: &str,
        dry_run: bool,
    ) -> PipelineResult<TableRun> {
        let table = self
            .config
            .table(name)
            .ok_or_else(|| CoreError::TableNotFound {
                name: name.to_string(),
            })?;
        let target = MergeTarget::for_table(&self.config, table, layer)?;
        let mut report = TableReport::new(&table.name, target.table.as_str(), layer);
        let full_refresh = options.full_refresh;

        self.check_cancelled(name)?;
        let current = self.meta.get_watermark(&target.source, &target.table)?;
        let since = match (&current, full_refresh) {
            (Some(wm), false) => wm.high_water_value.clone(),
            _ => WatermarkValue::Beginning,
        };
        let batch_id = options
            .batch_id
            .unwrap_or_else(|| current.as_ref().map_or(1, |wm| wm.last_batch_id + 1));
        let raw = self
            .reader
            .read(&ReadRequest {
                source: &target.source,
                since: &since,
                watermark_column: &table.watermark_column,
                watermark_type: watermark_type(table),
                batch_id,
            })
            .await?;
        report.rows_read = raw.len();
        log::debug!(
            "{}: read {} row(s) from {} since {since} as batch {batch_id}",
            target.table,
            raw.len(),
            target.source
        );
        if raw.is_empty() && !full_refresh {
            report.status = TableStatus::UpToDate;
            return Ok(TableRun {
                report,
                issues: Vec::new(),
            });
        }

        self.check_cancelled(name)?;
        let staged = Stager::for_table(table)?.stage(&raw)?;
        report.rows_rejected = staged.rejected_rows();
        report.rows_tagged = staged.tagged_rows();
        let issues = staged.issues;

        let batch = match layer {
            Layer::Raw | Layer::Staging => staged.batch,
            Layer::Intermediate | Layer::Fact => {
                self.check_cancelled(name)?;
                let widened = self.intermediate.transform(table, &staged.batch).await?;
                if layer == Layer::Fact {
                    widened.derive(Layer::Fact, Arc::clone(widened.schema()), widened.rows().to_vec())?
                } else {
                    widened
                }
            }
        };

        self.check_cancelled(name)?;
        let key_index = KeyIndex::for_table(self.meta.as_ref(), &self.config, table, layer)?;
        let classified = key_index.classify(batch, full_refresh)?;
        if classified.is_unchanged() {
            log::info!(
                "{}: nothing changed in {} row(s) since {since}; batch {batch_id} not committed",
                target.table,
                classified.rows.len()
            );
            report.status = TableStatus::UpToDate;
            return Ok(TableRun { report, issues });
        }
        let grain = GrainValidator::for_table(&self.config, table, layer)?.validate(
            &classified.batch,
            &classified.duplicates(),
            self.meta.as_ref(),
        )?;
        let stats = BatchStats::collect(
            &classified.batch,
            &table.grain_key,
            table.partition_column.as_deref(),
            &classified.unchanged(),
            &grain.orphan_rows(),
        )?;
        let baseline = self
            .meta
            .load_baseline(&target.table, self.config.anomaly.window)?;
        let anomaly = AnomalyDetector::from_config(
            &self.config.anomaly,
            options.effective_threshold(&self.config, table),
        )
        .assess(&stats, &baseline);
        let plan = MergePlanner::new(
            target.table.clone(),
            options.effective_policy(&self.config, table),
        )
        .with_partitioning(table.partition_column.is_some())
        .plan(classified, grain, anomaly, stats);
        log::debug!(
            "{}: planned {} for batch {} ({} write, {} delete, {} excluded)",
            target.table,
            plan.action,
            batch_id,
            plan.write_rows.len(),
            plan.delete_rows.len(),
            plan.excluded_rows.len()
        );

        if dry_run {
            let report = report.with_outcome(MergeOutcome::planned(&target, &plan));
            return Ok(TableRun { report, issues });
        }

        self.check_cancelled(name)?;
        let executor = MergeExecutor::new(
            Arc::clone(&self.db),
            self.meta.clone(),
            Arc::clone(&self.locks),
            options.effective_lock_mode(&self.config),
        );
        let outcome = executor.execute(&target, plan, &key_index, run_id).await?;
        let mut report = report.with_outcome(outcome);

        if report.status == TableStatus::Committed {
            let audits = Audit::for_table(&self.config, table, layer);
            let (results, summary) = AuditRunner::new(self.db.as_ref()).run_all(&audits).await;
            if !summary.all_passed() {
                log::warn!(
                    "{}: {} of {} audit(s) did not pass",
                    target.table,
                    summary.failed + summary.errors,
                    summary.total
                );
            }
            report.audits = results;
            report.audit_summary = Some(summary);
        }
        Ok(TableRun { report, issues })
    }

    fn record_history(
        &self,
        name: &str,
        run_id: &str,
        report: &TableReport,
        started_at: chrono::DateTime<Utc>,
    ) {
        let source = self
            .config
            .table(name)
            .map(|t| t.source.clone())
            .unwrap_or_default();
        let outcome = report.outcome.as_ref();
        let record = RunRecord {
            run_id: run_id.to_string(),
            layer: report.layer.to_string(),
            target_table: report.target.clone(),
            source,
            batch_id: outcome.map(|o| o.batch_id),
            action: outcome.map(|o| o.action.to_string()),
            phase: report.status.to_string(),
            rows_inserted: outcome.map_or(0, |o| o.rows_inserted as u64),
            rows_updated: outcome.map_or(0, |o| o.rows_updated as u64),
            rows_deleted: outcome.map_or(0, |o| o.rows_deleted as u64),
            rows_quarantined: outcome.map_or(0, |o| o.rows_quarantined as u64),
            warnings: outcome.map_or(0, |o| o.warnings.len() as u32),
            error: report.error.clone(),
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.meta.record_run(&record) {
            log::warn!("{name}: failed to record run history: {e}");
        }
    }
}

fn watermark_type(table: &TableConfig) -> ColumnType {
    table
        .columns
        .iter()
        .find(|c| c.name == table.watermark_column)
        .map_or(ColumnType::Text, |c| c.column_type)
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
