// Cluster-wide mutual exclusion for document read-modify-write cycles.
//
// Scopes hash to a fixed-width i64 so they map directly onto Postgres
// advisory locks. Every acquisition takes the process-local slot first and
// the shared advisory lock on top of it. When Postgres cannot be reached the
// manager degrades to the local slot alone, which keeps a single process
// correct but gives no cross-process exclusivity. An exhausted pool is
// contention, not an outage: the caller keeps waiting.

mod advisory;
mod local;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_common::DocumentKey;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use advisory::AdvisoryLocks;
pub use local::LocalLocks;

const REGISTRY_TOKEN: &str = "ydoc-registry";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock provider unavailable: {0}")]
    Unavailable(String),

    /// Reachable but saturated; retry later.
    #[error("lock provider busy")]
    Busy,
}

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    Document(DocumentKey),
    /// The set of every document key ever materialized.
    Registry,
}

impl LockScope {
    pub fn token(&self) -> String {
        match self {
            Self::Document(key) => format!("ydoc:{key}"),
            Self::Registry => REGISTRY_TOKEN.to_string(),
        }
    }

    /// Stable 64-bit id: the first 8 bytes of SHA-256(token), big-endian.
    pub fn lock_id(&self) -> i64 {
        let digest = Sha256::digest(self.token().as_bytes());
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(prefix)
    }
}

/// Proof of a held lock. Dropping it without [`LockBackend::release`] still
/// frees the lock, through connection loss for advisory locks.
pub struct LockHandle {
    lock_id: i64,
    held: Held,
}

enum Held {
    Advisory(advisory::AdvisoryHold),
    Local(local::LocalHold),
}

impl LockHandle {
    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }
}

/// Non-blocking lock capability. Blocking and fallback live in [`LockManager`].
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<LockHandle>, LockError>;

    async fn release(&self, handle: LockHandle);
}

#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Option<Arc<dyn LockBackend>>,
    local: LocalLocks,
    poll_interval: Duration,
    degraded: AtomicBool,
}

struct Guard {
    local: LockHandle,
    shared: Option<LockHandle>,
}

impl LockManager {
    /// Postgres advisory locks layered over local locks.
    pub fn advisory(pool: PgPool, poll_interval: Duration) -> Self {
        Self::layered(Arc::new(AdvisoryLocks::new(pool)), poll_interval)
    }

    /// `shared` layered over local locks.
    pub fn layered(shared: Arc<dyn LockBackend>, poll_interval: Duration) -> Self {
        Self::build(Some(shared), poll_interval)
    }

    /// Process-local locks only.
    pub fn local(poll_interval: Duration) -> Self {
        Self::build(None, poll_interval)
    }

    fn build(shared: Option<Arc<dyn LockBackend>>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared,
                local: LocalLocks::default(),
                poll_interval,
                degraded: AtomicBool::new(false),
            }),
        }
    }

    /// True while locks only exclude within this process.
    pub fn is_degraded(&self) -> bool {
        self.inner.shared.is_none() || self.inner.degraded.load(Ordering::Relaxed)
    }

    /// Run `f` while holding the lock for `scope`.
    ///
    /// Blocks, polling, until the lock is free. Never fails: an unreachable
    /// lock provider degrades to the local table. The lock is released when
    /// `f` completes, whatever it returns.
    pub async fn with_lock<F, Fut, T>(&self, scope: &LockScope, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(scope).await;
        let output = f().await;
        self.release(guard).await;
        output
    }

    async fn acquire(&self, scope: &LockScope) -> Guard {
        let lock_id = scope.lock_id();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire_once(scope, lock_id).await {
                if attempts > 1 {
                    debug!(scope = %scope.token(), attempts, "lock acquired after contention");
                }
                return guard;
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }

    async fn try_acquire_once(&self, scope: &LockScope, lock_id: i64) -> Option<Guard> {
        let local = match self.inner.local.try_acquire(lock_id).await {
            Ok(held) => held?,
            Err(error) => {
                warn!(scope = %scope.token(), error = %error, "local lock table failed");
                return None;
            }
        };

        let Some(shared) = &self.inner.shared else {
            return Some(Guard { local, shared: None });
        };

        match shared.try_acquire(lock_id).await {
            Ok(held) => {
                if self.inner.degraded.swap(false, Ordering::Relaxed) {
                    info!("advisory locks reachable again; leaving degraded lock mode");
                }
                match held {
                    Some(handle) => Some(Guard { local, shared: Some(handle) }),
                    None => {
                        self.inner.local.release(local).await;
                        None
                    }
                }
            }
            Err(LockError::Busy) => {
                debug!(scope = %scope.token(), "lock provider busy; waiting");
                self.inner.local.release(local).await;
                None
            }
            Err(error) => {
                if !self.inner.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        scope = %scope.token(),
                        error = %error,
                        "advisory lock provider unreachable; degraded to process-local locks"
                    );
                }
                Some(Guard { local, shared: None })
            }
        }
    }

    async fn release(&self, guard: Guard) {
        if let (Some(shared), Some(handle)) = (&self.inner.shared, guard.shared) {
            shared.release(handle).await;
        }
        self.inner.local.release(guard.local).await;
    }
}
