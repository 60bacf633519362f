// Debounced background flushes.
//
// At most one timer is pending per document: scheduling again replaces it.
// The superseded timer learns about it when its cancel sender is dropped.
// Cluster-wide exclusivity of the flush itself comes from the document lock;
// the semaphore only bounds how many flushes this process runs at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use docsync_common::{Author, DocumentKey};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use super::{FlushError, FlushOutcome, FlushRequest, Flusher};

struct Pending {
    generation: u64,
    _cancel: oneshot::Sender<()>,
}

struct Inner {
    flusher: Flusher,
    autosave_author: Author,
    pending: Mutex<HashMap<DocumentKey, Pending>>,
    permits: Semaphore,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct FlushScheduler {
    inner: Arc<Inner>,
}

impl FlushScheduler {
    pub fn new(flusher: Flusher, autosave_author: Author, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                flusher,
                autosave_author,
                pending: Mutex::new(HashMap::new()),
                permits: Semaphore::new(max_concurrent.max(1)),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn flusher(&self) -> &Flusher {
        &self.inner.flusher
    }

    /// Background flush request for `key`, attributed to the system identity.
    pub fn auto_save_request(&self, key: &DocumentKey) -> FlushRequest {
        FlushRequest::auto_save(key, &self.inner.autosave_author)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<DocumentKey, Pending>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Auto-save `key` after `delay`, replacing any timer already pending for it.
    pub fn schedule(&self, key: DocumentKey, delay: Duration) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let replaced = self
            .pending()
            .insert(key.clone(), Pending { generation, _cancel: cancel_tx })
            .is_some();
        debug!(document = %key, delay_ms = delay.as_millis() as u64, replaced, "flush scheduled");

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx => return,
            }
            scheduler.fire(key, generation).await;
        });
    }

    pub fn is_pending(&self, key: &DocumentKey) -> bool {
        self.pending().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Run a flush right away, still subject to the concurrency cap.
    pub async fn flush_now(
        &self,
        key: &DocumentKey,
        request: &FlushRequest,
    ) -> Result<FlushOutcome, FlushError> {
        let _permit = self.inner.permits.acquire().await.ok();
        self.inner.flusher.flush(key, request).await
    }

    async fn fire(&self, key: DocumentKey, generation: u64) {
        {
            let mut pending = self.pending();
            match pending.get(&key) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&key);
                }
                _ => return,
            }
        }

        let request = self.auto_save_request(&key);
        match self.flush_now(&key, &request).await {
            Ok(FlushOutcome::Deferred(remaining)) => {
                if self.is_pending(&key) {
                    debug!(document = %key, "newer flush already pending; dropping deferral");
                } else {
                    self.schedule(key, remaining);
                }
            }
            Ok(outcome) => debug!(document = %key, ?outcome, "scheduled flush finished"),
            Err(error) => {
                // Retried on the next edit, disconnect, or sweep.
                warn!(document = %key, error = %error, "scheduled flush failed");
            }
        }
    }
}
