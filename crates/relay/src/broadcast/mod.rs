// Document topic fan-out.
//
// `TopicBus` delivers within one process. `PgBus` layers Postgres
// LISTEN/NOTIFY on top of it so every relay process sharing the database
// sees every topic message.

mod local;
mod postgres;

use async_trait::async_trait;
use docsync_common::ChannelMessage;
use thiserror::Error;
use tokio::sync::broadcast;

pub use local::TopicBus;
pub use postgres::PgBus;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode broadcast: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Receive every message published on `topic` from now on.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage>;

    /// Deliver `message` to every subscriber of `topic`. Returns how many
    /// receivers in this process it reached.
    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<usize, BroadcastError>;

    /// Forget `topic` once its last local receiver is gone.
    fn prune(&self, topic: &str);

    /// Drop delivery bookkeeping that nobody can still need.
    async fn purge_expired(&self) -> Result<u64, BroadcastError> {
        Ok(0)
    }
}
