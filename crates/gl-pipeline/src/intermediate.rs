//! Intermediate layer: derived columns from lookups, then enrichment.

use crate::enrichment::{
    derive_key, CachedEnrichment, EnrichmentRecord, JsonEnrichmentProvider, LookupTable,
};
use crate::error::{PipelineError, PipelineResult};
use gl_core::{BatchSchema, Config, Layer, RecordBatch, Row, TableConfig, Value};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Lookups and the enrichment source shared by every table of a run.
#[derive(Default)]
pub struct IntermediateLayer {
    lookups: HashMap<String, LookupTable>,
    enrichment: Option<Arc<CachedEnrichment>>,
}

impl IntermediateLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every configured lookup and the enrichment file, if any.
    pub fn from_config(config: &Config, root: &Path) -> PipelineResult<Self> {
        let mut layer = Self::new();
        for name in config.lookups.keys() {
            if let Some(path) = config.lookup_path_absolute(root, name) {
                let table = LookupTable::load(name, &path)?;
                log::debug!("Loaded lookup {name} ({} entries)", table.len());
                layer = layer.with_lookup(name.clone(), table);
            }
        }
        if let Some(path) = config.enrichment_path_absolute(root) {
            let provider = JsonEnrichmentProvider::load(&path)?;
            log::debug!("Loaded enrichment source {}", path.display());
            layer = layer.with_enrichment(Arc::new(CachedEnrichment::new(Arc::new(provider))));
        }
        Ok(layer)
    }

    pub fn with_lookup(mut self, name: impl Into<String>, table: LookupTable) -> Self {
        self.lookups.insert(name.into(), table);
        self
    }

    pub fn with_enrichment(mut self, enrichment: Arc<CachedEnrichment>) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// Start a run with an empty enrichment cache.
    pub fn begin_run(&self) {
        if let Some(enrichment) = &self.enrichment {
            enrichment.clear();
        }
    }

    /// Widen a staged batch to the table's output columns.
    ///
    /// Derive rules only fill nulls. Enrichment fields are copied as text
    /// and stay null when the key is null or absent from the provider.
    pub async fn transform(
        &self,
        table: &TableConfig,
        staged: &RecordBatch,
    ) -> PipelineResult<RecordBatch> {
        let schema = Arc::new(BatchSchema::new(table.output_columns())?);
        let input = staged.schema();

        let mut rows: Vec<Vec<Value>> = staged
            .iter()
            .map(|row| {
                schema
                    .columns()
                    .iter()
                    .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        for rule in &table.derive {
            let lookup = self
                .lookups
                .get(&rule.lookup)
                .ok_or_else(|| PipelineError::InvalidLookup {
                    name: rule.lookup.clone(),
                    message: "lookup is not loaded".to_string(),
                })?;
            let target = schema.require(&rule.column)?;
            let from = input.require(&rule.from)?;
            let column_type = schema.columns()[target].column_type;
            let mut filled = 0usize;
            for (values, row) in rows.iter_mut().zip(staged.rows()) {
                if !values[target].is_null() {
                    continue;
                }
                let Some(source) = row.values()[from].as_text() else {
                    continue;
                };
                let Some(found) = derive_key(rule.function, source).and_then(|k| lookup.get(&k))
                else {
                    continue;
                };
                match column_type.coerce(found) {
                    Ok(value) => {
                        values[target] = value;
                        filled += 1;
                    }
                    Err(e) => log::debug!("{}: derived {} ignored: {e}", table.name, rule.column),
                }
            }
            if filled > 0 {
                log::debug!(
                    "{}: derived {filled} value(s) of {} from {}",
                    table.name,
                    rule.column,
                    rule.lookup
                );
            }
        }

        if let Some(config) = &table.enrichment {
            let enrichment = self
                .enrichment
                .as_ref()
                .ok_or_else(|| PipelineError::InvalidLookup {
                    name: "enrichment".to_string(),
                    message: format!("{} requires an enrichment source", table.name),
                })?;
            let key_pos = schema.require(&config.key_column)?;
            let field_positions = config
                .fields
                .iter()
                .map(|f| schema.require(f).map(|p| (f.as_str(), p)))
                .collect::<Result<Vec<_>, _>>()?;
            for values in rows.iter_mut() {
                if values[key_pos].is_null() {
                    continue;
                }
                let key = values[key_pos].canonical();
                let Some(record) = enrichment.get(&key).await? else {
                    continue;
                };
                for &(field, pos) in &field_positions {
                    if values[pos].is_null() {
                        values[pos] = field_value(&record, field);
                    }
                }
            }
        }

        let rows = rows
            .into_iter()
            .zip(staged.rows())
            .map(|(values, row)| Row::new(values, row.provenance().clone()))
            .collect();
        Ok(staged.derive(Layer::Intermediate, schema, rows)?)
    }
}

fn field_value(record: &EnrichmentRecord, field: &str) -> Value {
    match record.get(field) {
        None | Some(JsonValue::Null) => Value::Null,
        Some(JsonValue::String(s)) => Value::Text(s.clone()),
        Some(other) => Value::Text(other.to_string()),
    }
}
