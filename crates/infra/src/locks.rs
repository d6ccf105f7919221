//! Per-batch mutual exclusion.
//!
//! Serializes "read availability -> write" sections that touch the same batch
//! inside one process. Different batches proceed in parallel. Cross-process
//! safety comes from the batch version guard in the repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use stockhold_core::BatchId;

#[derive(Debug, Default)]
pub struct BatchLocks {
    slots: Mutex<HashMap<BatchId, Arc<AsyncMutex<()>>>>,
}

/// Holds the locks of a set of batches until dropped.
#[derive(Debug)]
pub struct BatchGuard {
    batches: Vec<BatchId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl BatchGuard {
    pub fn covers(&self, batch_id: BatchId) -> bool {
        self.batches.binary_search(&batch_id).is_ok()
    }

    pub fn covers_all(&self, ids: impl IntoIterator<Item = BatchId>) -> bool {
        ids.into_iter().all(|id| self.covers(id))
    }

    pub fn batches(&self) -> &[BatchId] {
        &self.batches
    }
}

impl BatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: BatchId) -> Arc<AsyncMutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(id).or_default().clone()
    }

    /// Lock every batch in `ids`, always in ascending id order so two callers
    /// with overlapping sets cannot deadlock.
    pub async fn acquire(&self, ids: impl IntoIterator<Item = BatchId>) -> BatchGuard {
        let mut batches: Vec<BatchId> = ids.into_iter().collect();
        batches.sort();
        batches.dedup();

        let mut guards = Vec::with_capacity(batches.len());
        for id in &batches {
            guards.push(self.slot(*id).lock_owned().await);
        }

        BatchGuard {
            batches,
            _guards: guards,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ids(raw: &[i64]) -> Vec<BatchId> {
        raw.iter().map(|r| BatchId::new(*r).unwrap()).collect()
    }

    #[tokio::test]
    async fn guard_reports_sorted_unique_cover() {
        let locks = BatchLocks::new();
        let guard = locks.acquire(ids(&[3, 1, 3, 2])).await;
        assert_eq!(guard.batches(), ids(&[1, 2, 3]).as_slice());
        assert!(guard.covers_all(ids(&[1, 3])));
        assert!(!guard.covers(BatchId::new(4).unwrap()));
    }

    #[tokio::test]
    async fn overlapping_sets_wait_for_each_other() {
        let locks = Arc::new(BatchLocks::new());
        let first = locks.acquire(ids(&[1, 2])).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(ids(&[2, 3])).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn disjoint_sets_do_not_block() {
        let locks = BatchLocks::new();
        let _a = locks.acquire(ids(&[1])).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(ids(&[2]))).await;
        assert!(b.is_ok());
    }
}
