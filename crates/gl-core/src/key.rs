//! Business keys and change fingerprints.

use crate::batch::RowRef;
use crate::checksum::compute_checksum_parts;
use crate::error::{CoreError, CoreResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

const KEY_SEPARATOR: char = '\u{1f}';

/// Stable identity of a row in a target table.
///
/// Composite keys are stored as the canonical text of each component joined
/// by the unit separator, so `("a|b", "c")` and `("a", "b|c")` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessKey(String);

impl BusinessKey {
    /// Build a key from its components; `None` if any component is null.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Self> {
        let mut parts = Vec::new();
        for value in values {
            if value.is_null() {
                return None;
            }
            parts.push(value.canonical());
        }
        Some(Self(parts.join(&KEY_SEPARATOR.to_string())))
    }

    /// Extract the key of `row` for the given key columns.
    ///
    /// `Ok(None)` means a key column is null.
    pub fn from_row<S: AsRef<str>>(row: &RowRef<'_>, columns: &[S]) -> CoreResult<Option<Self>> {
        let mut values = Vec::with_capacity(columns.len());
        for col in columns {
            let value = row.get(col.as_ref()).ok_or_else(|| CoreError::UnknownColumn {
                column: col.as_ref().to_string(),
            })?;
            values.push(value);
        }
        Ok(Self::from_values(values))
    }

    /// Rebuild a key from its stored form.
    pub fn from_stored(stored: impl Into<String>) -> Self {
        Self(stored.into())
    }

    /// The stored form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical text of each component.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.components().collect();
        f.write_str(&parts.join("|"))
    }
}

/// Hash of a row's mutable columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint `row` over `columns`, in the given order.
    ///
    /// Column names and value types take part in the hash, so reordering
    /// the configured columns or retyping one changes every fingerprint.
    pub fn of_row<S: AsRef<str>>(row: &RowRef<'_>, columns: &[S]) -> CoreResult<Self> {
        let mut parts = Vec::with_capacity(columns.len() * 2);
        for col in columns {
            let name = col.as_ref();
            let value = row.get(name).ok_or_else(|| CoreError::UnknownColumn {
                column: name.to_string(),
            })?;
            parts.push(name.to_string());
            parts.push(format!("{}:{}", value.type_tag(), value.canonical()));
        }
        Ok(Self(compute_checksum_parts(parts.iter().map(String::as_str))))
    }

    pub fn from_stored(stored: impl Into<String>) -> Self {
        Self(stored.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}
