// Shared state cache.
//
// All mutable document state lives here, outside process memory, so every
// relay process sees the same CRDT state, counters and revision markers.
// `KeyValueStore` is the pluggable backend; `DocumentCache` is the typed
// surface the rest of the relay uses.

pub mod keys;
mod memory;
mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use docsync_common::{DocumentKey, Revision};
use thiserror::Error;

pub use memory::MemoryKv;
pub use postgres::PgKv;

use crate::config::SyncTuning;
use keys::EntryKind;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend failed: {0}")]
    Backend(String),

    #[error("cache entry `{key}` is malformed: {reason}")]
    Decode { key: String, reason: String },
}

impl From<sqlx::Error> for CacheError {
    fn from(error: sqlx::Error) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Byte-valued store with per-key TTLs and a few atomic primitives.
///
/// Counters written by [`increment`](KeyValueStore::increment) are stored as
/// decimal text so a plain `get` can read them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Add `delta` to the counter (absent or expired counts as zero), reset
    /// its TTL and return the new value.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Reset the TTL of a live entry. Returns false when there is none.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Store `value` unless the live entry already holds exactly it. Returns
    /// true when this call wrote.
    async fn set_if_changed(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Physically drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Ttls {
    state: Duration,
    active: Duration,
    flush_head: Duration,
}

/// Typed accessors over the shared cache.
#[derive(Clone)]
pub struct DocumentCache {
    kv: Arc<dyn KeyValueStore>,
    ttls: Ttls,
}

impl DocumentCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, tuning: &SyncTuning) -> Self {
        Self {
            kv,
            ttls: Ttls {
                state: tuning.state_ttl,
                active: tuning.active_ttl,
                flush_head: tuning.flush_head_ttl,
            },
        }
    }

    pub async fn state(&self, key: &DocumentKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.kv.get(&keys::entry(EntryKind::State, key)).await
    }

    pub async fn put_state(&self, key: &DocumentKey, state: &[u8]) -> Result<(), CacheError> {
        self.kv.set(&keys::entry(EntryKind::State, key), state, Some(self.ttls.state)).await
    }

    pub async fn active_count(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        let name = keys::entry(EntryKind::ActiveCount, key);
        match self.kv.get(&name).await? {
            Some(raw) => decode_i64(&name, &raw),
            None => Ok(0),
        }
    }

    pub async fn increment_active(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        self.kv.increment(&keys::entry(EntryKind::ActiveCount, key), 1, self.ttls.active).await
    }

    pub async fn decrement_active(&self, key: &DocumentKey) -> Result<i64, CacheError> {
        self.kv.increment(&keys::entry(EntryKind::ActiveCount, key), -1, self.ttls.active).await
    }

    pub async fn clear_active(&self, key: &DocumentKey) -> Result<(), CacheError> {
        self.kv.delete(&keys::entry(EntryKind::ActiveCount, key)).await
    }

    /// Keep a live counter from expiring. Absent counters are left absent.
    pub async fn refresh_active(&self, key: &DocumentKey) -> Result<bool, CacheError> {
        self.kv.touch(&keys::entry(EntryKind::ActiveCount, key), self.ttls.active).await
    }

    /// Extend the cached state and the metadata derived from it by another
    /// state lifetime. Returns whether any state was cached.
    pub async fn refresh_state(&self, key: &DocumentKey) -> Result<bool, CacheError> {
        let cached = self.kv.touch(&keys::entry(EntryKind::State, key), self.ttls.state).await?;
        for kind in [EntryKind::LastEditAt, EntryKind::OriginHead] {
            self.kv.touch(&keys::entry(kind, key), self.ttls.state).await?;
        }
        Ok(cached)
    }

    pub async fn last_edit_at(&self, key: &DocumentKey) -> Result<Option<DateTime<Utc>>, CacheError> {
        let name = keys::entry(EntryKind::LastEditAt, key);
        let Some(raw) = self.kv.get(&name).await? else {
            return Ok(None);
        };
        let millis = decode_i64(&name, &raw)?;
        Utc.timestamp_millis_opt(millis).single().map(Some).ok_or_else(|| CacheError::Decode {
            key: name,
            reason: format!("timestamp {millis} out of range"),
        })
    }

    pub async fn record_edit(&self, key: &DocumentKey, at: DateTime<Utc>) -> Result<(), CacheError> {
        let millis = at.timestamp_millis().to_string();
        self.kv
            .set(&keys::entry(EntryKind::LastEditAt, key), millis.as_bytes(), Some(self.ttls.state))
            .await
    }

    pub async fn origin_head(&self, key: &DocumentKey) -> Result<Option<Revision>, CacheError> {
        self.revision(EntryKind::OriginHead, key).await
    }

    pub async fn set_origin_head(&self, key: &DocumentKey, revision: &Revision) -> Result<(), CacheError> {
        self.kv
            .set(
                &keys::entry(EntryKind::OriginHead, key),
                revision.as_str().as_bytes(),
                Some(self.ttls.state),
            )
            .await
    }

    pub async fn flush_head(&self, key: &DocumentKey) -> Result<Option<Revision>, CacheError> {
        self.revision(EntryKind::FlushHead, key).await
    }

    pub async fn set_flush_head(&self, key: &DocumentKey, revision: &Revision) -> Result<(), CacheError> {
        self.kv
            .set(
                &keys::entry(EntryKind::FlushHead, key),
                revision.as_str().as_bytes(),
                Some(self.ttls.flush_head),
            )
            .await
    }

    /// Drop the cached state together with the metadata derived from it.
    pub async fn invalidate(&self, key: &DocumentKey) -> Result<(), CacheError> {
        for kind in [EntryKind::State, EntryKind::LastEditAt, EntryKind::OriginHead] {
            self.kv.delete(&keys::entry(kind, key)).await?;
        }
        Ok(())
    }

    /// Claim the right to announce `revision` as an external change. Exactly
    /// one caller per revision, across processes, gets `true`.
    pub async fn claim_invalidation(
        &self,
        key: &DocumentKey,
        revision: &Revision,
    ) -> Result<bool, CacheError> {
        self.kv
            .set_if_changed(
                &keys::entry(EntryKind::InvalidatedHead, key),
                revision.as_str().as_bytes(),
                self.ttls.state,
            )
            .await
    }

    /// Give up a claim whose announcement never went out, so a later check
    /// can claim the same revision again.
    pub async fn release_invalidation(&self, key: &DocumentKey) -> Result<(), CacheError> {
        self.kv.delete(&keys::entry(EntryKind::InvalidatedHead, key)).await
    }

    pub async fn known_documents(&self) -> Result<BTreeSet<DocumentKey>, CacheError> {
        let Some(raw) = self.kv.get(keys::KNOWN_DOCUMENTS).await? else {
            return Ok(BTreeSet::new());
        };
        serde_json::from_slice(&raw).map_err(|error| CacheError::Decode {
            key: keys::KNOWN_DOCUMENTS.to_string(),
            reason: error.to_string(),
        })
    }

    pub async fn write_known_documents(
        &self,
        documents: &BTreeSet<DocumentKey>,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(documents).map_err(|error| CacheError::Decode {
            key: keys::KNOWN_DOCUMENTS.to_string(),
            reason: error.to_string(),
        })?;
        self.kv.set(keys::KNOWN_DOCUMENTS, &encoded, None).await
    }

    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        self.kv.purge_expired().await
    }

    async fn revision(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<Revision>, CacheError> {
        let name = keys::entry(kind, key);
        let Some(raw) = self.kv.get(&name).await? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(|id| Some(Revision::new(id)))
            .map_err(|error| CacheError::Decode { key: name, reason: error.to_string() })
    }
}

fn decode_i64(name: &str, raw: &[u8]) -> Result<i64, CacheError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok())
        .ok_or_else(|| CacheError::Decode { key: name.to_string(), reason: "not an integer".into() })
}
