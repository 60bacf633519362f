// Detection of durable-store changes made behind the relay's back.
//
// Live sessions poll the durable head. A new head is either one the relay
// committed itself, named by the short-lived flush-head marker, or an
// external change. External changes invalidate the cached state once per
// revision, however many sessions notice it.

use docsync_common::{ChannelMessage, DocumentKey, Revision};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastError;
use crate::cache::CacheError;
use crate::session::SyncServices;

#[derive(Debug, Error)]
enum ClassifyError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadCheck {
    Unchanged,
    /// The new head came from one of our own flushes.
    SelfCaused(Revision),
    /// This check invalidated the cache and announced the change.
    Invalidated(Revision),
    /// Another session already handled this revision.
    AlreadyInvalidated(Revision),
    /// The durable store or cache could not be queried; try again next tick.
    Unavailable,
}

/// Compare the durable head of `key` against `last_known`, which is updated
/// to the observed head unless the check could not complete.
pub async fn check_head(
    services: &SyncServices,
    key: &DocumentKey,
    last_known: &mut Option<Revision>,
) -> HeadCheck {
    let head = match services.store.head_revision(key).await {
        Ok(head) => head,
        Err(error) => {
            warn!(document = %key, error = %error, "head check failed");
            return HeadCheck::Unavailable;
        }
    };

    if head == *last_known {
        return HeadCheck::Unchanged;
    }
    let Some(head) = head else {
        debug!(document = %key, "durable copy disappeared");
        *last_known = None;
        return HeadCheck::Unchanged;
    };

    match classify(services, key, &head).await {
        Ok(check) => {
            *last_known = Some(head);
            check
        }
        Err(error) => {
            warn!(document = %key, error = %error, "head check could not complete");
            HeadCheck::Unavailable
        }
    }
}

// Origin heads also name revisions loaded from the durable store, external
// ones included, so only the flush marker identifies our own commits.
async fn classify(
    services: &SyncServices,
    key: &DocumentKey,
    head: &Revision,
) -> Result<HeadCheck, ClassifyError> {
    let cache = &services.cache;

    if cache.flush_head(key).await?.as_ref() == Some(head) {
        debug!(document = %key, revision = %head, "head change is our own flush");
        return Ok(HeadCheck::SelfCaused(head.clone()));
    }

    if !cache.claim_invalidation(key, head).await? {
        return Ok(HeadCheck::AlreadyInvalidated(head.clone()));
    }

    cache.invalidate(key).await?;
    let notified = match services.bus.publish(&key.topic(), ChannelMessage::FileChanged).await {
        Ok(notified) => notified,
        Err(error) => {
            if let Err(undo) = cache.release_invalidation(key).await {
                warn!(document = %key, error = %undo, "failed to release invalidation claim");
            }
            return Err(error.into());
        }
    };
    info!(document = %key, revision = %head, notified, "durable copy changed externally");
    Ok(HeadCheck::Invalidated(head.clone()))
}
