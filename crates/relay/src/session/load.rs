// Load-or-init of cached CRDT state.

use docsync_common::DocumentKey;
use tracing::{debug, info};

use super::{SessionError, SyncServices};
use crate::engine;
use crate::lock::LockScope;

/// Cached state for `key`, seeding the cache from the durable copy when it
/// is missing or was overtaken by an external change.
///
/// A cached state is only discarded while at most one editor is attached.
/// With more, their merged state is authoritative.
pub async fn load_or_init(services: &SyncServices, key: &DocumentKey) -> Result<Vec<u8>, SessionError> {
    let cache = &services.cache;
    let store = &services.store;

    services
        .locks
        .with_lock(&LockScope::Document(key.clone()), || async {
            let head = store.head_revision(key).await?;

            if let Some(cached) = cache.state(key).await? {
                let active = cache.active_count(key).await?;
                let origin = cache.origin_head(key).await?;
                if active > 1 || origin == head {
                    debug!(document = %key, active, "serving cached state");
                    return Ok(cached);
                }
                info!(
                    document = %key,
                    cached_head = origin.as_ref().map(|r| r.as_str()),
                    durable_head = head.as_ref().map(|r| r.as_str()),
                    "cached state is behind the durable copy; reloading"
                );
                cache.invalidate(key).await?;
            }

            let content = store.read(key).await?.unwrap_or_default();
            let state = engine::init(&content);
            cache.put_state(key, &state).await?;
            if let Some(head) = &head {
                cache.set_origin_head(key, head).await?;
            }
            debug!(document = %key, bytes = content.len(), "seeded state from durable copy");
            Ok::<_, SessionError>(state)
        })
        .await
}
