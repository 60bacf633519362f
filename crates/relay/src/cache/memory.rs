// Process-local cache backend for tests and single-process development runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, KeyValueStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// TTLs follow the tokio clock so paused-time tests can expire entries.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> Result<T, CacheError> {
        let mut entries =
            self.entries.lock().map_err(|_| CacheError::Backend("memory cache lock poisoned".into()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.live(now));
        Ok(f(&mut entries, now))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.with_entries(|entries, _| entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry { value: value.to_vec(), expires_at: ttl.map(|ttl| now + ttl) },
            );
        })
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.with_entries(|entries, _| {
            entries.remove(key);
        })
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        self.with_entries(|entries, now| {
            let current = entries
                .get(key)
                .and_then(|entry| std::str::from_utf8(&entry.value).ok()?.parse::<i64>().ok())
                .unwrap_or(0);
            let next = current + delta;
            entries.insert(
                key.to_string(),
                Entry { value: next.to_string().into_bytes(), expires_at: Some(now + ttl) },
            );
            next
        })
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        })
    }

    async fn set_if_changed(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        self.with_entries(|entries, now| {
            if entries.get(key).is_some_and(|entry| entry.value == value) {
                return false;
            }
            entries.insert(key.to_string(), Entry { value: value.to_vec(), expires_at: Some(now + ttl) });
            true
        })
    }
}
