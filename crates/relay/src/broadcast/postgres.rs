// Cross-process fan-out over Postgres LISTEN/NOTIFY.
//
// Every message is delivered to local subscribers immediately and then
// announced on one shared channel. Each process listens on that channel and
// re-delivers envelopes from other processes to its own `TopicBus`.
// Payloads above the NOTIFY limit are written to `sync_broadcasts` and the
// notification carries only the row id.

use std::time::Duration;

use async_trait::async_trait;
use docsync_common::ChannelMessage;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BroadcastError, MessageBus, TopicBus};

const CHANNEL: &str = "docsync_broadcast";
/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const MAX_INLINE_PAYLOAD: usize = 7900;
const SPILL_RETENTION: Duration = Duration::from_secs(300);
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<ChannelMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spilled: Option<Uuid>,
}

pub struct PgBus {
    pool: PgPool,
    local: TopicBus,
    origin: Uuid,
    listener: JoinHandle<()>,
}

impl PgBus {
    /// Start listening before returning so nothing published afterwards is
    /// missed.
    pub async fn connect(pool: PgPool) -> Result<Self, BroadcastError> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANNEL).await?;

        let local = TopicBus::default();
        let origin = Uuid::new_v4();
        let listener = tokio::spawn(listen(listener, pool.clone(), local.clone(), origin));
        info!(%origin, channel = CHANNEL, "broadcast listener started");

        Ok(Self { pool, local, origin, listener })
    }

    pub fn local(&self) -> &TopicBus {
        &self.local
    }

    async fn announce(&self, topic: &str, message: ChannelMessage) -> Result<(), BroadcastError> {
        let envelope = Envelope {
            origin: self.origin,
            topic: topic.to_string(),
            message: Some(message),
            spilled: None,
        };
        let mut payload = serde_json::to_string(&envelope)?;

        if payload.len() > MAX_INLINE_PAYLOAD {
            let id = Uuid::new_v4();
            let body = serde_json::to_string(&envelope.message)?;
            sqlx::query("INSERT INTO sync_broadcasts (id, topic, message) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(topic)
                .bind(body)
                .execute(&self.pool)
                .await?;
            payload = serde_json::to_string(&Envelope { message: None, spilled: Some(id), ..envelope })?;
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Drop for PgBus {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl MessageBus for PgBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage> {
        self.local.subscribe(topic)
    }

    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<usize, BroadcastError> {
        let delivered = self.local.deliver(topic, message.clone());
        self.announce(topic, message).await?;
        Ok(delivered)
    }

    fn prune(&self, topic: &str) {
        self.local.prune(topic);
    }

    async fn purge_expired(&self) -> Result<u64, BroadcastError> {
        let result = sqlx::query(
            "DELETE FROM sync_broadcasts WHERE created_at < now() - make_interval(secs => $1::float8)",
        )
        .bind(SPILL_RETENTION.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn listen(mut listener: PgListener, pool: PgPool, local: TopicBus, origin: Uuid) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                if let Err(error) = relay(&pool, &local, origin, notification.payload()).await {
                    warn!(error = %error, "dropping undeliverable broadcast");
                }
            }
            // The connection dropped and notifications may have been lost;
            // the next receive reconnects.
            Ok(None) => {
                warn!("broadcast listener reconnecting");
                local.send_all(ChannelMessage::FileChanged);
            }
            Err(error) => {
                warn!(error = %error, "broadcast listener failed");
                local.send_all(ChannelMessage::FileChanged);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn relay(pool: &PgPool, local: &TopicBus, origin: Uuid, payload: &str) -> Result<(), BroadcastError> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    if envelope.origin == origin {
        return Ok(());
    }

    let message = match (envelope.message, envelope.spilled) {
        (Some(message), _) => message,
        (None, Some(id)) => {
            let body = sqlx::query_scalar::<_, String>("SELECT message FROM sync_broadcasts WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
            match body {
                Some(body) => serde_json::from_str(&body)?,
                None => ChannelMessage::FileChanged,
            }
        }
        (None, None) => ChannelMessage::FileChanged,
    };

    let delivered = local.deliver(&envelope.topic, message);
    debug!(topic = %envelope.topic, receivers = delivered, "relayed broadcast");
    Ok(())
}
