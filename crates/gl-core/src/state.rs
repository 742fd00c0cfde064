//! Persisted merge state: watermarks and key-index entries.

use crate::key::{BusinessKey, Fingerprint};
use crate::names::{SourceName, TableName};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// High-water value of a watermark.
///
/// `Beginning` sorts before every concrete value and is only reachable
/// through a full-refresh reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WatermarkValue {
    Beginning,
    At(Value),
}

impl WatermarkValue {
    pub fn is_beginning(&self) -> bool {
        matches!(self, WatermarkValue::Beginning)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            WatermarkValue::Beginning => None,
            WatermarkValue::At(v) => Some(v),
        }
    }

    /// Whether a row with watermark value `candidate` should be read.
    ///
    /// Rows at the boundary are re-read. Null or incomparable values are
    /// admitted so staging can reject them explicitly.
    pub fn admits(&self, candidate: &Value) -> bool {
        match self {
            WatermarkValue::Beginning => true,
            WatermarkValue::At(current) => !matches!(
                candidate.partial_cmp(current),
                Some(Ordering::Less)
            ),
        }
    }

    /// The larger of `self` and `candidate`; incomparable candidates are ignored.
    pub fn max_with(self, candidate: &Value) -> WatermarkValue {
        if candidate.is_null() {
            return self;
        }
        let replace = match &self {
            WatermarkValue::Beginning => true,
            WatermarkValue::At(current) => {
                matches!(candidate.partial_cmp(current), Some(Ordering::Greater))
            }
        };
        if replace {
            WatermarkValue::At(candidate.clone())
        } else {
            self
        }
    }
}

impl PartialOrd for WatermarkValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (WatermarkValue::Beginning, WatermarkValue::Beginning) => Some(Ordering::Equal),
            (WatermarkValue::Beginning, WatermarkValue::At(_)) => Some(Ordering::Less),
            (WatermarkValue::At(_), WatermarkValue::Beginning) => Some(Ordering::Greater),
            (WatermarkValue::At(a), WatermarkValue::At(b)) => a.partial_cmp(b),
        }
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkValue::Beginning => f.write_str("<beginning>"),
            WatermarkValue::At(v) => write!(f, "{v}"),
        }
    }
}

/// High-water mark of one (source, target table) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watermark {
    pub source: SourceName,
    pub table: TableName,
    pub high_water_value: WatermarkValue,
    pub last_batch_id: u64,
    pub updated_at: DateTime<Utc>,
}

/// What the key index knows about one business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: BusinessKey,
    pub fingerprint: Fingerprint,
    pub last_seen_batch_id: u64,
    pub is_deleted: bool,
    /// Canonical partition value the key's row lives in
    pub partition: Option<String>,
}

impl KeyEntry {
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beginning_sorts_first() {
        assert!(WatermarkValue::Beginning < WatermarkValue::At(Value::Int(i64::MIN)));
        assert!(WatermarkValue::At(Value::Int(2)) > WatermarkValue::At(Value::Int(1)));
    }

    #[test]
    fn test_admits_boundary_and_unparseable() {
        let wm = WatermarkValue::At(Value::Int(10));
        assert!(wm.admits(&Value::Int(10)));
        assert!(wm.admits(&Value::Int(11)));
        assert!(!wm.admits(&Value::Int(9)));
        assert!(wm.admits(&Value::Text("not a number".into())));
        assert!(wm.admits(&Value::Null));
        assert!(WatermarkValue::Beginning.admits(&Value::Int(-5)));
    }

    #[test]
    fn test_max_with() {
        let wm = WatermarkValue::Beginning
            .max_with(&Value::Int(3))
            .max_with(&Value::Int(1))
            .max_with(&Value::Null);
        assert_eq!(wm, WatermarkValue::At(Value::Int(3)));
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&WatermarkValue::At(Value::Int(4))).unwrap();
        assert_eq!(json, r#"{"kind":"at","value":{"type":"int","value":4}}"#);
        let back: WatermarkValue = serde_json::from_str(r#"{"kind":"beginning"}"#).unwrap();
        assert!(back.is_beginning());
    }
}
