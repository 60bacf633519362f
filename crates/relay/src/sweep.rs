// Periodic eviction of documents nobody is editing.
//
// Phase one flushes and evicts every known document without subscribers.
// Phase two drops evicted documents from the registry, re-checking each one
// under the registry lock so a document re-opened in between stays known.

use std::collections::BTreeSet;
use std::time::Duration;

use docsync_common::DocumentKey;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::CacheError;
use crate::flush::FlushOutcome;
use crate::lock::LockScope;
use crate::session::SyncServices;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub skipped_active: usize,
    pub flushed: usize,
    pub evicted: usize,
    pub failed: usize,
    pub forgotten: usize,
    pub purged: u64,
}

#[derive(Clone)]
pub struct Sweeper {
    services: SyncServices,
}

impl Sweeper {
    pub fn new(services: SyncServices) -> Self {
        Self { services }
    }

    pub async fn run_once(&self) -> SweepReport {
        async {
            let mut report = SweepReport::default();

            let known = match self.services.registry.known_documents().await {
                Ok(known) => known,
                Err(error) => {
                    warn!(error = %error, "sweep could not read the document registry");
                    report.failed += 1;
                    return report;
                }
            };
            report.scanned = known.len();

            let evicted = self.flush_and_evict(&known, &mut report).await;
            match self.services.registry.forget_idle(&evicted).await {
                Ok(removed) => report.forgotten = removed.len(),
                Err(error) => {
                    warn!(error = %error, "sweep could not update the document registry");
                    report.failed += 1;
                }
            }

            match self.services.cache.purge_expired().await {
                Ok(purged) => report.purged = purged,
                Err(error) => warn!(error = %error, "failed to purge expired cache entries"),
            }
            match self.services.bus.purge_expired().await {
                Ok(purged) => report.purged += purged,
                Err(error) => warn!(error = %error, "failed to purge expired broadcasts"),
            }

            info!(
                scanned = report.scanned,
                flushed = report.flushed,
                evicted = report.evicted,
                failed = report.failed,
                forgotten = report.forgotten,
                "sweep finished"
            );
            report
        }
        .instrument(info_span!("relay.sweep"))
        .await
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its sender
    /// goes away.
    pub async fn run_loop(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("sweep loop stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn flush_and_evict(
        &self,
        known: &BTreeSet<DocumentKey>,
        report: &mut SweepReport,
    ) -> BTreeSet<DocumentKey> {
        let mut evicted = BTreeSet::new();

        for key in known {
            match self.services.cache.active_count(key).await {
                Ok(0) => {}
                Ok(_) => {
                    report.skipped_active += 1;
                    continue;
                }
                Err(error) => {
                    warn!(document = %key, error = %error, "sweep could not read active count");
                    report.failed += 1;
                    continue;
                }
            }

            let request = self.services.flushes.auto_save_request(key);
            match self.services.flushes.flush_now(key, &request).await {
                Ok(FlushOutcome::Committed(_)) => report.flushed += 1,
                Ok(FlushOutcome::Deferred(_)) => {
                    report.skipped_active += 1;
                    continue;
                }
                Ok(FlushOutcome::NothingCached | FlushOutcome::Unchanged) => {}
                Err(error) => {
                    // Evicting now would lose edits the durable copy lacks.
                    warn!(document = %key, error = %error, "sweep flush failed; keeping cached state");
                    report.failed += 1;
                    continue;
                }
            }

            match self.evict_if_idle(key).await {
                Ok(true) => {
                    report.evicted += 1;
                    evicted.insert(key.clone());
                }
                Ok(false) => report.skipped_active += 1,
                Err(error) => {
                    warn!(document = %key, error = %error, "sweep could not evict document");
                    report.failed += 1;
                }
            }
        }

        evicted
    }

    async fn evict_if_idle(&self, key: &DocumentKey) -> Result<bool, CacheError> {
        let cache = &self.services.cache;
        self.services
            .locks
            .with_lock(&LockScope::Document(key.clone()), || async {
                if cache.active_count(key).await? > 0 {
                    debug!(document = %key, "document re-opened during sweep");
                    return Ok(false);
                }
                cache.invalidate(key).await?;
                Ok::<_, CacheError>(true)
            })
            .await
    }
}
