//! Project configuration (`grainline.yml`).

use crate::batch::{ColumnDef, Layer};
use crate::dag::TableDag;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE_NAMES: &[&str] = &["grainline.yml", "grainline.yaml"];
const MEMORY_DB: &str = ":memory:";

/// Top-level project configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: String,

    /// Directory for reports, validation errors and the default databases
    #[serde(default = "default_target_path")]
    pub target_path: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// State database; defaults to `<target_path>/meta.duckdb`
    #[serde(default)]
    pub meta_path: Option<String>,

    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub lock_mode: LockMode,

    /// Maximum tables merged concurrently
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub layers: LayerSchemas,

    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Named JSON lookup files (object of key -> value)
    #[serde(default)]
    pub lookups: BTreeMap<String, String>,

    /// JSON file backing the enrichment provider
    #[serde(default)]
    pub enrichment: Option<String>,

    #[serde(default)]
    pub reports: ReportsConfig,
}

/// Target database settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// DuckDB file, relative to the project root, or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// How orphan rows and flagged anomalies are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Quarantine the batch
    #[default]
    Strict,
    /// Drop offending rows and proceed with warnings
    Permissive,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Strict => f.write_str("strict"),
            Policy::Permissive => f.write_str("permissive"),
        }
    }
}

impl FromStr for Policy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Policy::Strict),
            "permissive" => Ok(Policy::Permissive),
            other => Err(CoreError::ConfigInvalid {
                message: format!("unknown policy '{other}' (expected strict or permissive)"),
            }),
        }
    }
}

/// Behaviour when a partition lock is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Wait for the holder (scheduled runs)
    #[default]
    Block,
    /// Fail with a write conflict (ad-hoc runs)
    FailFast,
}

/// Deviation statistic used by the anomaly detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStrategy {
    /// `|x - mean| / sigma`, with a relative floor on sigma
    #[default]
    Zscore,
    /// `x / quantile(history)`
    Percentile,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyConfig {
    #[serde(default)]
    pub strategy: AnomalyStrategy,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Baseline points kept per metric
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Quantile used by the percentile strategy
    #[serde(default = "default_quantile")]
    pub quantile: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            strategy: AnomalyStrategy::default(),
            threshold: default_threshold(),
            window: default_window(),
            min_history: default_min_history(),
            quantile: default_quantile(),
        }
    }
}

/// Schema names for each layer's target tables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSchemas {
    #[serde(default = "default_staging_schema")]
    pub staging: String,
    #[serde(default = "default_intermediate_schema")]
    pub intermediate: String,
    #[serde(default = "default_fact_schema")]
    pub fact: String,
}

impl Default for LayerSchemas {
    fn default() -> Self {
        Self {
            staging: default_staging_schema(),
            intermediate: default_intermediate_schema(),
            fact: default_fact_schema(),
        }
    }
}

impl LayerSchemas {
    pub fn schema_for(&self, layer: Layer) -> &str {
        match layer {
            Layer::Raw => "raw",
            Layer::Staging => &self.staging,
            Layer::Intermediate => &self.intermediate,
            Layer::Fact => &self.fact,
        }
    }
}

/// One merged table
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,

    /// Source file relative to the project root
    pub source: String,

    pub watermark_column: String,

    pub grain_key: Vec<String>,

    #[serde(default)]
    pub partition_column: Option<String>,

    pub columns: Vec<ColumnDef>,

    /// Columns hashed into the change fingerprint; defaults to every
    /// non-key column
    #[serde(default)]
    pub mutable_columns: Option<Vec<String>>,

    /// Boolean column marking a row as deleted at the source
    #[serde(default)]
    pub delete_flag_column: Option<String>,

    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyConfig>,

    #[serde(default)]
    pub temporal: Vec<TemporalRule>,

    #[serde(default)]
    pub rules: Vec<PatternRule>,

    #[serde(default)]
    pub fill_forward: Vec<FillForwardRule>,

    #[serde(default)]
    pub derive: Vec<DeriveRule>,

    #[serde(default)]
    pub enrichment: Option<EnrichmentConfig>,

    #[serde(default)]
    pub policy: Option<Policy>,

    #[serde(default)]
    pub anomaly_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyConfig {
    pub columns: Vec<String>,
    /// Referenced table name (unqualified)
    pub references: String,
    /// Referenced key columns; default is the parent's grain key
    #[serde(default)]
    pub parent_columns: Option<Vec<String>>,
}

/// `start` must not be later than `end`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TemporalRule {
    pub start: String,
    pub end: String,
}

/// Regex a non-null text cell must match
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    pub column: String,
    pub pattern: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Carry the last non-null value of `column` forward within a group
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FillForwardRule {
    pub column: String,
    #[serde(default)]
    pub partition_by: Vec<String>,
}

/// Fill nulls of `column` from a named lookup keyed by a function of `from`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeriveRule {
    pub column: String,
    pub from: String,
    pub lookup: String,
    #[serde(default)]
    pub function: DeriveFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeriveFunction {
    /// Use the source value as the lookup key
    #[default]
    Identity,
    /// Lower-cased domain part of an email address
    EmailDomain,
}

/// Append provider fields keyed by `key_column`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    pub key_column: String,
    pub fields: Vec<String>,
}

/// Optional quality reports exported by `grainline report`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReportsConfig {
    #[serde(default)]
    pub coverage_gaps: Option<CoverageGapReport>,
    #[serde(default)]
    pub cost_spikes: Option<CostSpikeReport>,
    #[serde(default)]
    pub roster_mismatch: Option<RosterReport>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoverageGapReport {
    pub table: String,
    pub group_by: Vec<String>,
    pub start_column: String,
    pub end_column: String,
    pub carrier_column: String,
    #[serde(default = "default_min_gap_days")]
    pub min_gap_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CostSpikeReport {
    pub table: String,
    pub group_by: Vec<String>,
    pub date_column: String,
    pub amount_column: String,
    #[serde(default = "default_spike_window")]
    pub window_days: i64,
    /// Relative increase, 2.0 = +200%
    #[serde(default = "default_spike_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RosterReport {
    pub table: String,
    pub group_column: String,
    /// Expected row count per group value
    pub expected: BTreeMap<String, i64>,
}

/// Per-invocation overrides
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub tables: Vec<String>,
    pub policy: Option<Policy>,
    pub full_refresh: bool,
    pub anomaly_threshold: Option<f64>,
    pub lock_mode: Option<LockMode>,
    /// Explicit batch id; defaults to the last committed id + 1
    pub batch_id: Option<u64>,
    pub threads: Option<usize>,
}

impl RunOptions {
    /// Invocation override, then table setting, then project default.
    pub fn effective_policy(&self, config: &Config, table: &TableConfig) -> Policy {
        self.policy.or(table.policy).unwrap_or(config.policy)
    }

    pub fn effective_threshold(&self, config: &Config, table: &TableConfig) -> f64 {
        self.anomaly_threshold
            .or(table.anomaly_threshold)
            .unwrap_or(config.anomaly.threshold)
    }

    pub fn effective_lock_mode(&self, config: &Config) -> LockMode {
        self.lock_mode.unwrap_or(config.lock_mode)
    }

    pub fn effective_threads(&self, config: &Config) -> usize {
        self.threads.unwrap_or(config.threads).max(1)
    }
}

fn default_target_path() -> String {
    "target".to_string()
}

fn default_db_path() -> String {
    "target/warehouse.duckdb".to_string()
}

fn default_threads() -> usize {
    4
}

fn default_threshold() -> f64 {
    3.0
}

fn default_window() -> usize {
    30
}

fn default_min_history() -> usize {
    3
}

fn default_quantile() -> f64 {
    0.95
}

fn default_staging_schema() -> String {
    "staging".to_string()
}

fn default_intermediate_schema() -> String {
    "intermediate".to_string()
}

fn default_fact_schema() -> String {
    "fact".to_string()
}

fn default_min_gap_days() -> i64 {
    7
}

fn default_spike_window() -> i64 {
    90
}

fn default_spike_threshold() -> f64 {
    2.0
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::ConfigInvalid {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        let config = Self::from_yaml(&content)?;
        log::debug!(
            "Loaded project '{}' with {} table(s) from {}",
            config.name,
            config.tables.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> CoreResult<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `grainline.yml` (or `.yaml`) from a project directory
    pub fn load_from_dir(dir: &Path) -> CoreResult<Self> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
            .map(|p| Self::load(&p))
            .unwrap_or_else(|| {
                Err(CoreError::ConfigNotFound {
                    path: dir.join(CONFIG_FILE_NAMES[0]).display().to_string(),
                })
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("Project name cannot be empty"));
        }
        if self.threads == 0 {
            return Err(invalid("threads must be at least 1"));
        }
        self.validate_anomaly()?;

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(invalid(format!("Duplicate table '{}'", table.name)));
            }
        }
        for table in &self.tables {
            self.validate_table(table)?;
        }
        self.dag()?;
        self.validate_reports()
    }

    fn validate_anomaly(&self) -> CoreResult<()> {
        let a = &self.anomaly;
        if a.threshold <= 0.0 || !a.threshold.is_finite() {
            return Err(invalid("anomaly.threshold must be a positive number"));
        }
        if a.min_history == 0 || a.window < a.min_history {
            return Err(invalid(
                "anomaly.min_history must be at least 1 and not larger than anomaly.window",
            ));
        }
        if !(a.quantile > 0.0 && a.quantile < 1.0) {
            return Err(invalid("anomaly.quantile must be between 0 and 1"));
        }
        Ok(())
    }

    fn validate_table(&self, table: &TableConfig) -> CoreResult<()> {
        let name = &table.name;
        if name.is_empty() || name.contains('.') {
            return Err(invalid(format!(
                "Table name '{name}' must be non-empty and unqualified"
            )));
        }
        if table.grain_key.is_empty() {
            return Err(invalid(format!("Table '{name}' has an empty grain_key")));
        }
        crate::batch::BatchSchema::new(table.output_columns())
            .map_err(|e| invalid(format!("Table '{name}': {e}")))?;

        let declared: HashSet<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        let output: Vec<ColumnDef> = table.output_columns();
        let output: HashSet<&str> = output.iter().map(|c| c.name.as_str()).collect();
        let require = |column: &str, what: &str, pool: &HashSet<&str>| -> CoreResult<()> {
            if pool.contains(column) {
                Ok(())
            } else {
                Err(invalid(format!(
                    "Table '{name}': {what} column '{column}' is not declared"
                )))
            }
        };

        require(&table.watermark_column, "watermark", &declared)?;
        for col in &table.grain_key {
            require(col, "grain key", &output)?;
        }
        if let Some(col) = &table.partition_column {
            require(col, "partition", &output)?;
        }
        if let Some(cols) = &table.mutable_columns {
            for col in cols {
                require(col, "mutable", &output)?;
            }
        }
        if let Some(col) = &table.delete_flag_column {
            require(col, "delete flag", &declared)?;
        }
        for rule in &table.temporal {
            require(&rule.start, "temporal start", &output)?;
            require(&rule.end, "temporal end", &output)?;
        }
        for rule in &table.rules {
            require(&rule.column, "rule", &declared)?;
            regex::Regex::new(&rule.pattern).map_err(|e| {
                invalid(format!(
                    "Table '{name}': invalid pattern for '{}': {e}",
                    rule.column
                ))
            })?;
        }
        for rule in &table.fill_forward {
            require(&rule.column, "fill_forward", &declared)?;
            for col in &rule.partition_by {
                require(col, "fill_forward partition", &declared)?;
            }
        }
        for rule in &table.derive {
            require(&rule.column, "derive target", &declared)?;
            require(&rule.from, "derive source", &declared)?;
            if !self.lookups.contains_key(&rule.lookup) {
                return Err(invalid(format!(
                    "Table '{name}': derive uses unknown lookup '{}'",
                    rule.lookup
                )));
            }
        }
        if let Some(enrichment) = &table.enrichment {
            require(&enrichment.key_column, "enrichment key", &declared)?;
            if self.enrichment.is_none() {
                return Err(invalid(format!(
                    "Table '{name}' declares enrichment but no enrichment file is configured"
                )));
            }
        }
        for fk in &table.foreign_keys {
            for col in &fk.columns {
                require(col, "foreign key", &output)?;
            }
            let parent = self.table(&fk.references).ok_or_else(|| {
                invalid(format!(
                    "Table '{name}': foreign key references unknown table '{}'",
                    fk.references
                ))
            })?;
            let parent_columns = fk.parent_columns.as_ref().unwrap_or(&parent.grain_key);
            if parent_columns.len() != fk.columns.len() {
                return Err(invalid(format!(
                    "Table '{name}': foreign key to '{}' maps {} columns onto {}",
                    fk.references,
                    fk.columns.len(),
                    parent_columns.len()
                )));
            }
            if parent_columns != &parent.grain_key {
                return Err(invalid(format!(
                    "Table '{name}': foreign key to '{}' must reference its grain key",
                    fk.references
                )));
            }
        }
        if let Some(t) = table.anomaly_threshold {
            if t <= 0.0 || !t.is_finite() {
                return Err(invalid(format!(
                    "Table '{name}': anomaly_threshold must be positive"
                )));
            }
        }
        Ok(())
    }

    fn validate_reports(&self) -> CoreResult<()> {
        let r = &self.reports;
        let tables = [
            r.coverage_gaps.as_ref().map(|c| c.table.as_str()),
            r.cost_spikes.as_ref().map(|c| c.table.as_str()),
            r.roster_mismatch.as_ref().map(|c| c.table.as_str()),
        ];
        for table in tables.into_iter().flatten() {
            if self.table(table).is_none() {
                return Err(invalid(format!("Report references unknown table '{table}'")));
            }
        }
        if let Some(c) = &r.cost_spikes {
            if c.window_days <= 0 || c.threshold <= 0.0 {
                return Err(invalid("cost_spikes window_days and threshold must be positive"));
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Look up tables by name, preserving config order; empty selects all.
    pub fn select_tables(&self, names: &[String]) -> CoreResult<Vec<&TableConfig>> {
        for name in names {
            if self.table(name).is_none() {
                return Err(CoreError::TableNotFound { name: name.clone() });
            }
        }
        Ok(self
            .tables
            .iter()
            .filter(|t| names.is_empty() || names.contains(&t.name))
            .collect())
    }

    /// Foreign-key DAG over every configured table
    pub fn dag(&self) -> CoreResult<TableDag> {
        let deps: BTreeMap<String, Vec<String>> = self
            .tables
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    t.foreign_keys.iter().map(|fk| fk.references.clone()).collect(),
                )
            })
            .collect();
        TableDag::build(&deps)
    }

    pub fn target_path_absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.target_path)
    }

    /// Target database path, `None` for an in-memory database
    pub fn database_path_absolute(&self, root: &Path) -> Option<PathBuf> {
        if self.database.path == MEMORY_DB {
            None
        } else {
            Some(root.join(&self.database.path))
        }
    }

    pub fn meta_path_absolute(&self, root: &Path) -> PathBuf {
        match &self.meta_path {
            Some(p) => root.join(p),
            None => self.target_path_absolute(root).join("meta.duckdb"),
        }
    }

    pub fn lookup_path_absolute(&self, root: &Path, name: &str) -> Option<PathBuf> {
        self.lookups.get(name).map(|p| root.join(p))
    }

    pub fn enrichment_path_absolute(&self, root: &Path) -> Option<PathBuf> {
        self.enrichment.as_ref().map(|p| root.join(p))
    }
}

impl TableConfig {
    /// Columns after the intermediate layer: declared columns plus
    /// enrichment fields as text.
    pub fn output_columns(&self) -> Vec<ColumnDef> {
        let mut columns = self.columns.clone();
        if let Some(enrichment) = &self.enrichment {
            for field in &enrichment.fields {
                if !columns.iter().any(|c| &c.name == field) {
                    columns.push(ColumnDef::new(field.clone(), crate::value::ColumnType::Text));
                }
            }
        }
        columns
    }

    /// Columns for a given layer's batches
    pub fn columns_for(&self, layer: Layer) -> Vec<ColumnDef> {
        match layer {
            Layer::Raw | Layer::Staging => self.columns.clone(),
            Layer::Intermediate | Layer::Fact => self.output_columns(),
        }
    }

    /// Fingerprinted columns for a layer: configured, or every non-key column.
    pub fn mutable_columns_for(&self, layer: Layer) -> Vec<String> {
        let available = self.columns_for(layer);
        match &self.mutable_columns {
            Some(cols) => cols
                .iter()
                .filter(|c| available.iter().any(|a| &a.name == *c))
                .cloned()
                .collect(),
            None => available
                .into_iter()
                .map(|c| c.name)
                .filter(|c| !self.grain_key.contains(c))
                .collect(),
        }
    }

    /// `<schema>.<name>` for the given layer
    pub fn target_for(&self, layer: Layer, schemas: &LayerSchemas) -> String {
        format!("{}.{}", schemas.schema_for(layer), self.name)
    }

    /// Parent columns of a foreign key, defaulting to the parent's grain key
    pub fn parent_columns<'a>(fk: &'a ForeignKeyConfig, parent: &'a TableConfig) -> &'a [String] {
        fk.parent_columns.as_deref().unwrap_or(&parent.grain_key)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
