// Process-local lock table keyed by lock id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::{Held, LockBackend, LockError, LockHandle};

pub(super) struct LocalHold {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
pub struct LocalLocks {
    table: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLocks {
    fn slot(&self, lock_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(lock_id).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl LockBackend for LocalLocks {
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<LockHandle>, LockError> {
        let slot = self.slot(lock_id);
        Ok(slot
            .try_lock_owned()
            .ok()
            .map(|guard| LockHandle { lock_id, held: Held::Local(LocalHold { _guard: guard }) }))
    }

    async fn release(&self, handle: LockHandle) {
        let lock_id = handle.lock_id;
        drop(handle);

        // Only the table still references an idle slot.
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(&lock_id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            table.remove(&lock_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let locks = LocalLocks::default();
        let first = locks.try_acquire(42).await.unwrap().expect("free lock");
        assert!(locks.try_acquire(42).await.unwrap().is_none());
        assert!(locks.try_acquire(43).await.unwrap().is_some());

        locks.release(first).await;
        assert!(locks.try_acquire(42).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = LocalLocks::default();
        let handle = locks.try_acquire(7).await.unwrap().unwrap();
        assert_eq!(locks.len(), 1);
        locks.release(handle).await;
        assert_eq!(locks.len(), 0);
    }
}
