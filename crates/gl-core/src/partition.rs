//! Partition sets touched by a merge.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Canonical partition value; `None` is the null partition.
pub type PartitionValue = Option<String>;

/// The partitions a write may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSet {
    /// Unpartitioned table or full refresh
    All,
    Values(BTreeSet<PartitionValue>),
}

impl PartitionSet {
    pub fn empty() -> Self {
        PartitionSet::Values(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PartitionSet::Values(v) if v.is_empty())
    }

    /// Add one partition; a no-op on `All`.
    pub fn insert(&mut self, value: PartitionValue) {
        if let PartitionSet::Values(values) = self {
            values.insert(value);
        }
    }

    /// Whether two writes could touch a common partition.
    pub fn overlaps(&self, other: &PartitionSet) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        match (self, other) {
            (PartitionSet::Values(a), PartitionSet::Values(b)) => !a.is_disjoint(b),
            _ => true,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            PartitionSet::All => None,
            PartitionSet::Values(v) => Some(v.len()),
        }
    }
}

impl fmt::Display for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionSet::All => f.write_str("all"),
            PartitionSet::Values(values) => {
                let parts: Vec<&str> = values
                    .iter()
                    .map(|v| v.as_deref().unwrap_or("NULL"))
                    .collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}
