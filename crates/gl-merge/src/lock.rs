//! Exclusive locks over (table, partition set) pairs.
//!
//! Two writes conflict when they target the same table and their partition
//! sets overlap. `LockMode::Block` waits for the holder to release;
//! `LockMode::FailFast` returns a write conflict immediately.

use crate::error::{MergeError, MergeResult};
use gl_core::{LockMode, PartitionSet, TableName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct PartitionLocks {
    held: Mutex<HashMap<TableName, Vec<(u64, PartitionSet)>>>,
    released: Notify,
    next_id: AtomicU64,
}

impl PartitionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held(&self) -> MutexGuard<'_, HashMap<TableName, Vec<(u64, PartitionSet)>>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn try_acquire(&self, table: &TableName, partitions: &PartitionSet) -> Option<u64> {
        let mut held = self.held();
        let entries = held.entry(table.clone()).or_default();
        if entries.iter().any(|(_, p)| p.overlaps(partitions)) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push((id, partitions.clone()));
        Some(id)
    }

    /// Take the lock for `partitions` of `table`.
    pub async fn acquire(
        self: &Arc<Self>,
        table: &TableName,
        partitions: PartitionSet,
        mode: LockMode,
    ) -> MergeResult<PartitionGuard> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_acquire(table, &partitions) {
                log::debug!("{table}: locked partitions {partitions}");
                return Ok(PartitionGuard {
                    locks: Arc::clone(self),
                    table: table.clone(),
                    id,
                });
            }
            if mode == LockMode::FailFast {
                return Err(MergeError::WriteConflict {
                    table: table.to_string(),
                    partitions: partitions.to_string(),
                });
            }
            log::debug!("{table}: waiting for partitions {partitions}");
            notified.await;
        }
    }

    /// Number of locks currently held on `table`
    pub fn held_count(&self, table: &TableName) -> usize {
        self.held().get(table).map_or(0, Vec::len)
    }

    fn release(&self, table: &TableName, id: u64) {
        {
            let mut held = self.held();
            if let Some(entries) = held.get_mut(table) {
                entries.retain(|(held_id, _)| *held_id != id);
                if entries.is_empty() {
                    held.remove(table);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Releases its partitions on drop.
#[derive(Debug)]
pub struct PartitionGuard {
    locks: Arc<PartitionLocks>,
    table: TableName,
    id: u64,
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        self.locks.release(&self.table, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn table() -> TableName {
        TableName::parse("fact.claims").unwrap()
    }

    fn parts(values: &[&str]) -> PartitionSet {
        PartitionSet::Values(
            values
                .iter()
                .map(|v| Some(v.to_string()))
                .collect::<BTreeSet<_>>(),
        )
    }

    #[tokio::test]
    async fn test_disjoint_partitions_do_not_conflict() {
        let locks = PartitionLocks::new();
        let _a = locks
            .acquire(&table(), parts(&["2024-01"]), LockMode::FailFast)
            .await
            .unwrap();
        let _b = locks
            .acquire(&table(), parts(&["2024-02"]), LockMode::FailFast)
            .await
            .unwrap();
        let other = TableName::parse("fact.plans").unwrap();
        let _c = locks
            .acquire(&other, PartitionSet::All, LockMode::FailFast)
            .await
            .unwrap();
        assert_eq!(locks.held_count(&table()), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_conflict() {
        let locks = PartitionLocks::new();
        let _held = locks
            .acquire(&table(), parts(&["2024-01", "2024-02"]), LockMode::FailFast)
            .await
            .unwrap();
        let err = locks
            .acquire(&table(), parts(&["2024-02"]), LockMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::WriteConflict { .. }));
        assert!(err.is_retryable());

        let err = locks
            .acquire(&table(), PartitionSet::All, LockMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::WriteConflict { .. }));
    }

    #[tokio::test]
    async fn test_empty_set_never_conflicts() {
        let locks = PartitionLocks::new();
        let _all = locks
            .acquire(&table(), PartitionSet::All, LockMode::FailFast)
            .await
            .unwrap();
        assert!(locks
            .acquire(&table(), PartitionSet::empty(), LockMode::FailFast)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let locks = PartitionLocks::new();
        let guard = locks
            .acquire(&table(), PartitionSet::All, LockMode::FailFast)
            .await
            .unwrap();
        drop(guard);
        assert_eq!(locks.held_count(&table()), 0);
        assert!(locks
            .acquire(&table(), PartitionSet::All, LockMode::FailFast)
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_waits_for_release() {
        let locks = PartitionLocks::new();
        let guard = locks
            .acquire(&table(), parts(&["2024-01"]), LockMode::Block)
            .await
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire(&table(), parts(&["2024-01"]), LockMode::Block)
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let acquired = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }
}
