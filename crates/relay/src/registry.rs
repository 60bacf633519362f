// Active-subscriber bookkeeping.
//
// Counts are advisory: they expire after `active_ttl` without a refresh, so
// a crashed process cannot pin a document as "open" forever. The set of
// known documents is only rewritten under the registry lock.

use std::collections::BTreeSet;

use docsync_common::DocumentKey;
use tracing::debug;

use crate::cache::{CacheError, DocumentCache};
use crate::lock::{LockManager, LockScope};

#[derive(Clone)]
pub struct SubscriberRegistry {
    cache: DocumentCache,
    locks: LockManager,
}

impl SubscriberRegistry {
    pub fn new(cache: DocumentCache, locks: LockManager) -> Self {
        Self { cache, locks }
    }

    /// Count one more subscriber and remember the document for the sweep.
    /// Returns the new count.
    pub async fn register(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        self.locks
            .with_lock(&LockScope::Registry, || async {
                let count = self.cache.increment_active(key).await?;
                let mut known = self.cache.known_documents().await?;
                if known.insert(key.clone()) {
                    self.cache.write_known_documents(&known).await?;
                }
                Ok::<_, CacheError>(count)
            })
            .await
    }

    /// Count one subscriber fewer. The counter is deleted once it reaches
    /// zero, and the returned count is never negative. Runs under the
    /// registry lock so a concurrent register cannot be wiped by the delete.
    pub async fn deregister(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        self.locks
            .with_lock(&LockScope::Registry, || async {
                let remaining = self.cache.decrement_active(key).await?;
                if remaining <= 0 {
                    self.cache.clear_active(key).await?;
                    return Ok(0);
                }
                Ok::<_, CacheError>(remaining)
            })
            .await
    }

    pub async fn refresh_ttl(&self, key: &DocumentKey) -> Result<bool, CacheError> {
        self.cache.refresh_active(key).await
    }

    pub async fn active_count(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        self.cache.active_count(key).await
    }

    pub async fn known_documents(&self) -> Result<BTreeSet<DocumentKey>, CacheError> {
        self.cache.known_documents().await
    }

    /// Drop keys from the known set, skipping any that picked up cached state
    /// or a subscriber since the caller decided they were idle. Returns the
    /// keys actually removed.
    pub async fn forget_idle(
        &self,
        candidates: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeSet<DocumentKey>, CacheError> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        self.locks
            .with_lock(&LockScope::Registry, || async {
                let mut known = self.cache.known_documents().await?;
                let mut removed = BTreeSet::new();

                for key in candidates {
                    if !known.contains(key) {
                        continue;
                    }
                    let cached = self.cache.state(key).await?.is_some();
                    let active = self.cache.active_count(key).await?;
                    if cached || active > 0 {
                        debug!(document = %key, cached, active, "document re-activated; keeping it registered");
                        continue;
                    }
                    known.remove(key);
                    removed.insert(key.clone());
                }

                if !removed.is_empty() {
                    self.cache.write_known_documents(&known).await?;
                }
                Ok::<_, CacheError>(removed)
            })
            .await
    }
}
