// Persisting converged CRDT state to the durable store.
//
// `Flusher` runs one flush under the document lock. `FlushScheduler` decides
// when flushes run: debounced per document, capped in concurrency.

mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docsync_common::{Author, DocumentKey, Revision};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub use scheduler::FlushScheduler;

use crate::cache::{CacheError, DocumentCache};
use crate::clock::Clock;
use crate::engine::{self, EngineError};
use crate::lock::{LockManager, LockScope};
use crate::store::{DurableStore, StoreError};

#[derive(Debug, Error)]
pub enum FlushError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("durable copy moved past {expected}; reload before saving")]
    StaleWrite { expected: Revision, actual: Option<Revision> },
}

impl From<StoreError> for FlushError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::StaleBase { expected, actual } => Self::StaleWrite { expected, actual },
            other => Self::Store(other),
        }
    }
}

/// Who a flush is for and how it is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub author: Author,
    pub message: String,
    /// Only commit while the document's durable head is still this revision.
    pub base_revision: Option<Revision>,
    /// Defer while editors are attached and the last edit is recent.
    pub honor_debounce: bool,
}

impl FlushRequest {
    /// Background flush attributed to the system identity.
    pub fn auto_save(key: &DocumentKey, author: &Author) -> Self {
        Self {
            author: author.clone(),
            message: format!("Auto-save {}", key.path()),
            base_revision: None,
            honor_debounce: true,
        }
    }

    /// Flush requested by an editor; runs regardless of recent activity.
    pub fn explicit_save(key: &DocumentKey, author: Author, base_revision: Option<Revision>) -> Self {
        Self { author, message: format!("Save {}", key.path()), base_revision, honor_debounce: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No cached state; nothing to persist.
    NothingCached,
    /// Edited too recently; try again after the remaining quiet period.
    Deferred(Duration),
    /// Durable content already matches.
    Unchanged,
    Committed(Revision),
}

#[derive(Clone)]
pub struct Flusher {
    cache: DocumentCache,
    locks: LockManager,
    store: Arc<dyn DurableStore>,
    debounce: Duration,
    clock: Clock,
}

impl Flusher {
    pub fn new(
        cache: DocumentCache,
        locks: LockManager,
        store: Arc<dyn DurableStore>,
        debounce: Duration,
    ) -> Self {
        Self { cache, locks, store, debounce, clock: Clock::System }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn flush(
        &self,
        key: &DocumentKey,
        request: &FlushRequest,
    ) -> Result<FlushOutcome, FlushError> {
        self.flush_at(key, request, self.clock.now()).await
    }

    pub async fn flush_at(
        &self,
        key: &DocumentKey,
        request: &FlushRequest,
        now: DateTime<Utc>,
    ) -> Result<FlushOutcome, FlushError> {
        let scope = LockScope::Document(key.clone());
        self.locks
            .with_lock(&scope, || self.flush_locked(key, request, now))
            .instrument(info_span!("relay.flush", document = %key, message = %request.message))
            .await
    }

    async fn flush_locked(
        &self,
        key: &DocumentKey,
        request: &FlushRequest,
        now: DateTime<Utc>,
    ) -> Result<FlushOutcome, FlushError> {
        let Some(state) = self.cache.state(key).await? else {
            return Ok(FlushOutcome::NothingCached);
        };

        if request.honor_debounce && self.cache.active_count(key).await? > 0 {
            if let Some(remaining) = self.remaining_quiet_period(key, now).await? {
                debug!(remaining_ms = remaining.as_millis() as u64, "document still being edited; deferring flush");
                return Ok(FlushOutcome::Deferred(remaining));
            }
        }

        let content = engine::materialize(&state)?;
        let durable = self.store.read(key).await?.unwrap_or_default();
        if durable == content {
            return Ok(FlushOutcome::Unchanged);
        }

        let revision = self
            .store
            .commit(key, &content, &request.author, &request.message, request.base_revision.as_ref())
            .await?;

        self.cache.set_flush_head(key, &revision).await?;
        self.cache.set_origin_head(key, &revision).await?;
        self.cache.put_state(key, &state).await?;

        info!(revision = %revision, author = %request.author.name, "flushed document");
        Ok(FlushOutcome::Committed(revision))
    }

    async fn remaining_quiet_period(
        &self,
        key: &DocumentKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, FlushError> {
        let Some(last_edit) = self.cache.last_edit_at(key).await? else {
            return Ok(None);
        };
        let elapsed = (now - last_edit).to_std().unwrap_or(Duration::ZERO);
        Ok(self.debounce.checked_sub(elapsed).filter(|remaining| !remaining.is_zero()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use uuid::Uuid;

    use super::*;
    use crate::cache::MemoryKv;
    use crate::config::SyncTuning;
    use crate::engine::testing::edit;
    use crate::store::MemoryStore;

    struct Fixture {
        cache: DocumentCache,
        store: Arc<MemoryStore>,
        flusher: Flusher,
        key: DocumentKey,
    }

    fn fixture() -> Fixture {
        let tuning = SyncTuning::default();
        let cache = DocumentCache::new(Arc::new(MemoryKv::default()), &tuning);
        let store = Arc::new(MemoryStore::default());
        let flusher = Flusher::new(
            cache.clone(),
            LockManager::local(tuning.lock_poll_interval),
            store.clone(),
            tuning.flush_debounce,
        );
        Fixture { cache, store, flusher, key: DocumentKey::new(Uuid::new_v4(), "notes/a.md").unwrap() }
    }

    fn system() -> Author {
        Author::new("docsync", "docsync@localhost")
    }

    async fn cache_text(fx: &Fixture, text: &str) {
        let state = engine::merge(None, &edit(&engine::init(""), 1, 0, text)).unwrap();
        fx.cache.put_state(&fx.key, &state).await.unwrap();
    }

    #[tokio::test]
    async fn nothing_cached_is_a_no_op() {
        let fx = fixture();
        let outcome = fx.flusher.flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system())).await;
        assert_eq!(outcome.unwrap(), FlushOutcome::NothingCached);
        assert_eq!(fx.store.commit_count(&fx.key), 0);
    }

    #[tokio::test]
    async fn commit_records_flush_and_origin_heads() {
        let fx = fixture();
        cache_text(&fx, "hello").await;

        let outcome =
            fx.flusher.flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system())).await.unwrap();
        let FlushOutcome::Committed(revision) = outcome else {
            panic!("expected a commit, got {outcome:?}");
        };

        let commits = fx.store.commits(&fx.key);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].content, "hello");
        assert_eq!(commits[0].message, "Auto-save notes/a.md");
        assert_eq!(commits[0].author, system());
        assert_eq!(fx.cache.flush_head(&fx.key).await.unwrap(), Some(revision.clone()));
        assert_eq!(fx.cache.origin_head(&fx.key).await.unwrap(), Some(revision));
    }

    #[tokio::test]
    async fn identical_content_does_not_commit() {
        let fx = fixture();
        fx.store.external_commit(&fx.key, "hello");
        cache_text(&fx, "hello").await;

        let outcome =
            fx.flusher.flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system())).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Unchanged);
        assert_eq!(fx.store.commit_count(&fx.key), 1);
    }

    #[tokio::test]
    async fn empty_document_without_durable_copy_is_unchanged() {
        let fx = fixture();
        fx.cache.put_state(&fx.key, &engine::init("")).await.unwrap();

        let outcome =
            fx.flusher.flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system())).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Unchanged);
    }

    #[tokio::test]
    async fn recent_edit_with_active_editors_defers_for_the_remaining_window() {
        let fx = fixture();
        cache_text(&fx, "draft").await;
        fx.cache.increment_active(&fx.key).await.unwrap();
        let edited_at = Utc::now();
        fx.cache.record_edit(&fx.key, edited_at).await.unwrap();
        let request = FlushRequest::auto_save(&fx.key, &system());

        let outcome =
            fx.flusher.flush_at(&fx.key, &request, edited_at + TimeDelta::seconds(10)).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Deferred(Duration::from_secs(20)));

        let outcome =
            fx.flusher.flush_at(&fx.key, &request, edited_at + TimeDelta::seconds(30)).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Committed(_)));
        assert_eq!(fx.store.commit_count(&fx.key), 1);
    }

    #[tokio::test]
    async fn idle_document_flushes_despite_recent_edit() {
        let fx = fixture();
        cache_text(&fx, "draft").await;
        fx.cache.record_edit(&fx.key, Utc::now()).await.unwrap();

        let outcome =
            fx.flusher.flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system())).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Committed(_)));
    }

    #[tokio::test]
    async fn explicit_save_ignores_the_debounce_window() {
        let fx = fixture();
        cache_text(&fx, "draft").await;
        fx.cache.increment_active(&fx.key).await.unwrap();
        fx.cache.record_edit(&fx.key, Utc::now()).await.unwrap();
        let ada = Author::new("Ada", "ada@example.com");

        let outcome = fx
            .flusher
            .flush(&fx.key, &FlushRequest::explicit_save(&fx.key, ada.clone(), None))
            .await
            .unwrap();
        assert!(matches!(outcome, FlushOutcome::Committed(_)));
        let commits = fx.store.commits(&fx.key);
        assert_eq!(commits[0].author, ada);
        assert_eq!(commits[0].message, "Save notes/a.md");
    }

    #[tokio::test]
    async fn stale_base_surfaces_as_stale_write() {
        let fx = fixture();
        let base = fx.store.external_commit(&fx.key, "one");
        let moved = fx.store.external_commit(&fx.key, "two");
        cache_text(&fx, "mine").await;

        let request = FlushRequest::explicit_save(&fx.key, system(), Some(base.clone()));
        let error = fx.flusher.flush(&fx.key, &request).await.unwrap_err();
        assert!(matches!(
            error,
            FlushError::StaleWrite { expected, actual } if expected == base && actual == Some(moved)
        ));
        assert_eq!(fx.store.commit_count(&fx.key), 2);
    }

    #[tokio::test]
    async fn store_outage_leaves_cache_untouched() {
        let fx = fixture();
        cache_text(&fx, "hello").await;
        fx.store.set_available(false);

        let error = fx
            .flusher
            .flush(&fx.key, &FlushRequest::auto_save(&fx.key, &system()))
            .await
            .unwrap_err();
        assert!(matches!(error, FlushError::Store(StoreError::Unavailable(_))));
        assert!(fx.cache.state(&fx.key).await.unwrap().is_some());
        assert!(fx.cache.flush_head(&fx.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_saves_commit_once() {
        let fx = fixture();
        cache_text(&fx, "hello").await;
        let request = FlushRequest::explicit_save(&fx.key, system(), None);

        let (first, second) =
            tokio::join!(fx.flusher.flush(&fx.key, &request), fx.flusher.flush(&fx.key, &request));
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| matches!(o, FlushOutcome::Committed(_))).count(), 1);
        assert!(outcomes.contains(&FlushOutcome::Unchanged));
        assert_eq!(fx.store.commit_count(&fx.key), 1);
    }
}
