//! Enrichment providers and named lookup tables.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use gl_core::config::DeriveFunction;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fields returned for one key
pub type EnrichmentRecord = BTreeMap<String, JsonValue>;

/// External enrichment source.
///
/// `lookup` returns every match: none means absent, more than one is a
/// configuration error reported by [`single_match`].
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn lookup(&self, key: &str) -> PipelineResult<Vec<EnrichmentRecord>>;
}

/// Reduce provider matches to at most one record.
pub fn single_match(
    key: &str,
    mut matches: Vec<EnrichmentRecord>,
) -> PipelineResult<Option<EnrichmentRecord>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        n => Err(PipelineError::EnrichmentFanOut {
            key: key.to_string(),
            matches: n,
        }),
    }
}

/// Provider backed by a JSON object mapping each key to a record, or to an
/// array of records.
#[derive(Debug, Clone, Default)]
pub struct JsonEnrichmentProvider {
    records: HashMap<String, Vec<EnrichmentRecord>>,
}

impl JsonEnrichmentProvider {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::InvalidLookup {
            name: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&path.display().to_string(), &content)
    }

    pub fn from_json(name: &str, content: &str) -> PipelineResult<Self> {
        let invalid = |message: String| PipelineError::InvalidLookup {
            name: name.to_string(),
            message,
        };
        let root: JsonValue = serde_json::from_str(content)?;
        let JsonValue::Object(entries) = root else {
            return Err(invalid("expected a JSON object keyed by lookup value".into()));
        };
        let mut records = HashMap::new();
        for (key, value) in entries {
            let matches = match value {
                JsonValue::Object(fields) => vec![fields.into_iter().collect()],
                JsonValue::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        JsonValue::Object(fields) => Ok(fields.into_iter().collect()),
                        _ => Err(invalid(format!("entry '{key}' holds a non-object record"))),
                    })
                    .collect::<PipelineResult<Vec<_>>>()?,
                _ => return Err(invalid(format!("entry '{key}' is not a record"))),
            };
            records.insert(key, matches);
        }
        Ok(Self { records })
    }
}

#[async_trait]
impl EnrichmentProvider for JsonEnrichmentProvider {
    async fn lookup(&self, key: &str) -> PipelineResult<Vec<EnrichmentRecord>> {
        Ok(self.records.get(key).cloned().unwrap_or_default())
    }
}

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Per-run cache in front of a provider.
///
/// Transient failures are retried with linear backoff; after the last
/// attempt the key resolves to absent. Fan-out is never retried.
pub struct CachedEnrichment {
    provider: Arc<dyn EnrichmentProvider>,
    cache: Mutex<HashMap<String, Option<EnrichmentRecord>>>,
    attempts: u32,
    backoff: Duration,
}

impl CachedEnrichment {
    pub fn new(provider: Arc<dyn EnrichmentProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Delay before retry `n` is `n * backoff`.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    fn cached(&self, key: &str) -> Option<Option<EnrichmentRecord>> {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn store(&self, key: &str, record: Option<EnrichmentRecord>) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), record);
    }

    pub async fn get(&self, key: &str) -> PipelineResult<Option<EnrichmentRecord>> {
        if let Some(hit) = self.cached(key) {
            log::debug!("enrichment cache hit for {key}");
            return Ok(hit);
        }
        for attempt in 1..=self.attempts {
            match self.provider.lookup(key).await {
                Ok(matches) => {
                    let record = single_match(key, matches)?;
                    self.store(key, record.clone());
                    return Ok(record);
                }
                Err(e @ PipelineError::EnrichmentFanOut { .. }) => return Err(e),
                Err(e) if attempt < self.attempts => {
                    let wait = self.backoff * attempt;
                    log::warn!(
                        "enrichment attempt {attempt} for {key} failed: {e}; retrying in {}ms",
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    log::warn!(
                        "enrichment for {key} failed after {} attempts, leaving fields empty: {e}",
                        self.attempts
                    );
                }
            }
        }
        self.store(key, None);
        Ok(None)
    }

    /// Forget every cached key; called when a run starts.
    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Named string-to-string lookup (e.g. email domain -> company EIN).
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    entries: HashMap<String, String>,
}

impl LookupTable {
    pub fn load(name: &str, path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::InvalidLookup {
            name: name.to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json(name, &content)
    }

    pub fn from_json(name: &str, content: &str) -> PipelineResult<Self> {
        let raw: HashMap<String, JsonValue> = serde_json::from_str(content)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let value = match value {
                JsonValue::String(s) => s,
                JsonValue::Number(n) => n.to_string(),
                other => {
                    return Err(PipelineError::InvalidLookup {
                        name: name.to_string(),
                        message: format!("value for '{key}' is not a scalar: {other}"),
                    })
                }
            };
            entries.insert(key.to_ascii_lowercase(), value);
        }
        Ok(Self { entries })
    }

    /// Keys are matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lookup key derived from a source cell.
pub fn derive_key(function: DeriveFunction, value: &str) -> Option<String> {
    let value = value.trim();
    match function {
        DeriveFunction::Identity => (!value.is_empty()).then(|| value.to_string()),
        DeriveFunction::EmailDomain => value
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty()),
    }
}

#[cfg(test)]
#[path = "enrichment_test.rs"]
mod tests;
