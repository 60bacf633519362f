// Per-connection document sessions.
//
// A session never keeps document state itself. Every read-modify-write goes
// through the shared cache under the document lock, and fan-out happens on
// the topic bus after the lock is released.

pub mod load;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use docsync_common::{Author, ChannelMessage, DocumentKey, KeyError, Revision};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{AccessError, AccessPolicy, ProjectRole};
use crate::broadcast::{MessageBus, TopicBus};
use crate::cache::{CacheError, DocumentCache, KeyValueStore};
use crate::config::SyncTuning;
use crate::engine::{self, EngineError};
use crate::flush::{FlushError, FlushOutcome, FlushRequest, FlushScheduler, Flusher};
use crate::lock::{LockManager, LockScope};
use crate::registry::SubscriberRegistry;
use crate::staleness::{self, HeadCheck};
use crate::store::{DurableStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("access denied")]
    AccessDenied,

    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("`{0}` messages are not accepted from editors")]
    InvalidMessage(&'static str),

    #[error("update rejected: {0}")]
    UpdateRejected(#[source] EngineError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Flush(#[from] FlushError),

    #[error("session is closed")]
    Closed,
}

/// Everything a session needs, shared by every session in the process.
#[derive(Clone)]
pub struct SyncServices {
    pub tuning: SyncTuning,
    pub locks: LockManager,
    pub cache: DocumentCache,
    pub registry: SubscriberRegistry,
    pub store: Arc<dyn DurableStore>,
    pub bus: Arc<dyn MessageBus>,
    pub access: AccessPolicy,
    pub flushes: FlushScheduler,
}

impl SyncServices {
    pub fn new(
        tuning: SyncTuning,
        autosave_author: Author,
        kv: Arc<dyn KeyValueStore>,
        locks: LockManager,
        store: Arc<dyn DurableStore>,
        access: AccessPolicy,
    ) -> Self {
        let cache = DocumentCache::new(kv, &tuning);
        let registry = SubscriberRegistry::new(cache.clone(), locks.clone());
        let flusher = Flusher::new(cache.clone(), locks.clone(), store.clone(), tuning.flush_debounce)
            .with_clock(tuning.clock);
        let flushes = FlushScheduler::new(flusher, autosave_author, tuning.max_concurrent_flushes);

        Self {
            tuning,
            locks,
            cache,
            registry,
            store,
            bus: Arc::new(TopicBus::default()),
            access,
            flushes,
        }
    }

    /// Fan out through `bus` instead of the in-process default.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = bus;
        self
    }
}

/// The authenticated caller behind a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
    /// Identity recorded on explicit saves.
    pub author: Author,
}

impl SessionUser {
    pub fn new(id: Uuid, name: Option<String>, email: Option<String>) -> Self {
        let name = name.filter(|name| !name.trim().is_empty()).unwrap_or_else(|| id.to_string());
        let email =
            email.filter(|email| !email.trim().is_empty()).unwrap_or_else(|| format!("{id}@users.docsync"));
        Self { id, author: Author::new(name, email) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Syncing,
    Live,
    Closed,
}

pub struct Subscription {
    pub session: DocumentSession,
    /// Initial `sync` message for the subscriber.
    pub sync: ChannelMessage,
    /// Broadcasts on the document topic, including this session's own.
    pub updates: broadcast::Receiver<ChannelMessage>,
}

pub struct DocumentSession {
    services: SyncServices,
    key: DocumentKey,
    user: SessionUser,
    role: ProjectRole,
    state: SessionState,
    last_known_head: Option<Revision>,
}

impl DocumentSession {
    /// Open `raw_path` in `project_id` for `user`.
    pub async fn subscribe(
        services: SyncServices,
        project_id: Uuid,
        raw_path: &str,
        user: SessionUser,
    ) -> Result<Subscription, SessionError> {
        let key = DocumentKey::new(project_id, raw_path)?;

        let role = services.access.role_for_user(project_id, user.id).await?.ok_or_else(|| {
            info!(document = %key, user_id = %user.id, "subscription rejected");
            SessionError::AccessDenied
        })?;

        let mut session = Self {
            services,
            key,
            user,
            role,
            state: SessionState::Connecting,
            last_known_head: None,
        };
        session.last_known_head = session.services.store.head_revision(&session.key).await?;

        let updates = session.services.bus.subscribe(&session.key.topic());
        let active = match session.services.registry.register(&session.key).await {
            Ok(active) => active,
            Err(error) => {
                drop(updates);
                session.services.bus.prune(&session.key.topic());
                return Err(error.into());
            }
        };
        session.state = SessionState::Syncing;

        let doc_state = match load::load_or_init(&session.services, &session.key).await {
            Ok(doc_state) => doc_state,
            Err(error) => {
                drop(updates);
                session.state = SessionState::Closed;
                if let Err(undo) = session.services.registry.deregister(&session.key).await {
                    warn!(document = %session.key, error = %undo, "failed to undo registration");
                }
                session.services.bus.prune(&session.key.topic());
                return Err(error);
            }
        };

        session.state = SessionState::Live;
        info!(document = %session.key, user_id = %session.user.id, active, "session live");
        let sync = ChannelMessage::Sync { state: STANDARD.encode(&doc_state) };
        Ok(Subscription { session, sync, updates })
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_known_head(&self) -> Option<&Revision> {
        self.last_known_head.as_ref()
    }

    /// Handle one message from the editor. Returns a direct reply, if any.
    pub async fn receive(
        &mut self,
        message: ChannelMessage,
    ) -> Result<Option<ChannelMessage>, SessionError> {
        if self.state != SessionState::Live {
            return Err(SessionError::Closed);
        }

        match message {
            ChannelMessage::Update { update, sender } => {
                self.apply_update(update, sender).await?;
                Ok(None)
            }
            ChannelMessage::Awareness { update, sender } => {
                let topic = self.key.topic();
                if let Err(error) =
                    self.services.bus.publish(&topic, ChannelMessage::Awareness { update, sender }).await
                {
                    warn!(document = %self.key, error = %error, "failed to relay awareness");
                }
                Ok(None)
            }
            ChannelMessage::Save { base_revision } => self.save(base_revision).await.map(Some),
            other => Err(SessionError::InvalidMessage(other.kind())),
        }
    }

    async fn apply_update(&self, update: String, sender: String) -> Result<(), SessionError> {
        if !self.role.can_edit() {
            return Err(SessionError::AccessDenied);
        }
        let bytes = STANDARD
            .decode(update.as_bytes())
            .map_err(|error| SessionError::InvalidPayload(error.to_string()))?;

        let cache = &self.services.cache;
        let clock = self.services.tuning.clock;
        let key = &self.key;
        self.services
            .locks
            .with_lock(&LockScope::Document(key.clone()), || async {
                let current = cache.state(key).await?;
                let merged =
                    engine::merge(current.as_deref(), &bytes).map_err(SessionError::UpdateRejected)?;
                cache.put_state(key, &merged).await?;
                cache.record_edit(key, clock.now()).await?;
                Ok::<_, SessionError>(())
            })
            .await?;

        if let Err(error) =
            self.services.bus.publish(&key.topic(), ChannelMessage::Update { update, sender }).await
        {
            warn!(document = %key, error = %error, "failed to broadcast update");
        }
        self.services.flushes.schedule(key.clone(), self.services.tuning.flush_debounce);
        Ok(())
    }

    async fn save(&mut self, base_revision: Option<Revision>) -> Result<ChannelMessage, SessionError> {
        if !self.role.can_edit() {
            return Err(SessionError::AccessDenied);
        }

        let request = FlushRequest::explicit_save(&self.key, self.user.author.clone(), base_revision);
        let outcome = self.services.flushes.flush_now(&self.key, &request).await?;
        let revision = match outcome {
            FlushOutcome::Committed(revision) => {
                self.last_known_head = Some(revision.clone());
                Some(revision)
            }
            FlushOutcome::NothingCached | FlushOutcome::Unchanged | FlushOutcome::Deferred(_) => {
                self.last_known_head.clone()
            }
        };
        Ok(ChannelMessage::Saved { revision })
    }

    /// Periodic liveness refresh plus durable-head comparison. Keeps the
    /// active counter and the cached state alive while the session is open.
    pub async fn check_head(&mut self) -> HeadCheck {
        if self.state != SessionState::Live {
            return HeadCheck::Unchanged;
        }
        if let Err(error) = self.services.registry.refresh_ttl(&self.key).await {
            warn!(document = %self.key, error = %error, "failed to refresh active count");
        }
        if let Err(error) = self.services.cache.refresh_state(&self.key).await {
            warn!(document = %self.key, error = %error, "failed to refresh cached state");
        }
        staleness::check_head(&self.services, &self.key, &mut self.last_known_head).await
    }

    /// Leave the document. Safe to call more than once.
    pub async fn unsubscribe(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;

        let remaining = self.services.registry.deregister(&self.key).await?;
        self.services.bus.prune(&self.key.topic());
        if remaining == 0 {
            self.services.flushes.schedule(self.key.clone(), self.services.tuning.idle_flush_delay);
        }
        debug!(document = %self.key, user_id = %self.user.id, remaining, "session closed");
        Ok(())
    }
}
