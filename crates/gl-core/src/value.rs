//! Typed cell values and the column types they are coerced to.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Declared type of a batch column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
}

impl ColumnType {
    /// DuckDB column type used for target tables.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE",
            ColumnType::Text => "VARCHAR",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Coerce a raw cell into this type.
    ///
    /// The cell is trimmed first; an empty cell is `Value::Null` for every type.
    /// Numbers may carry thousands separators and a leading `$`.
    pub fn coerce(&self, raw: &str) -> CoreResult<Value> {
        let cell = raw.trim();
        if cell.is_empty() {
            return Ok(Value::Null);
        }
        let fail = || CoreError::Coercion {
            value: cell.to_string(),
            target: self.to_string(),
        };
        match self {
            ColumnType::Text => Ok(Value::Text(cell.to_string())),
            ColumnType::Boolean => match cell.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            ColumnType::Integer => strip_number(cell)
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| fail()),
            ColumnType::Float => strip_number(cell)
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(fail),
            ColumnType::Date => parse_date(cell).map(Value::Date).ok_or_else(fail),
            ColumnType::Timestamp => parse_timestamp(cell)
                .map(Value::Timestamp)
                .ok_or_else(fail),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

fn strip_number(cell: &str) -> String {
    cell.trim_start_matches('$').replace(',', "")
}

/// Parse `YYYY-MM-DD`, `YYYY/MM/DD` or `MM/DD/YYYY`.
pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cell, fmt).ok())
}

/// Parse an RFC 3339 timestamp (normalized to UTC) or `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(cell: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(cell) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    /// Short tag that distinguishes types inside fingerprints.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Null => "n",
            Value::Bool(_) => "b",
            Value::Int(_) => "i",
            Value::Float(_) => "f",
            Value::Text(_) => "s",
            Value::Date(_) => "d",
            Value::Timestamp(_) => "t",
        }
    }

    /// Canonical text form.
    ///
    /// Dates and timestamps use ISO formats that DuckDB casts back losslessly;
    /// `Null` renders as an empty string.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }
    }

    /// Plain JSON rendering used for quarantine rows and reports.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            other => serde_json::Value::String(other.canonical()),
        }
    }
}

impl PartialOrd for Value {
    /// Values of the same type compare naturally, integers and floats compare
    /// numerically, dates compare with timestamps at midnight. Anything else,
    /// including `Null`, is unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Timestamp(b)) => a.and_hms_opt(0, 0, 0)?.partial_cmp(b),
            (Value::Timestamp(a), Value::Date(b)) => a.partial_cmp(&b.and_hms_opt(0, 0, 0)?),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            other => f.write_str(&other.canonical()),
        }
    }
}

#[cfg(test)]
#[path = "value_test.rs"]
mod tests;
