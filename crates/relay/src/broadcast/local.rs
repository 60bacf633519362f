// In-process publish/subscribe keyed by topic string.
//
// Each topic gets a lazily created `tokio::sync::broadcast` channel. Order
// is preserved per topic; a receiver that falls more than `capacity`
// messages behind observes `RecvError::Lagged` and must resync.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use docsync_common::ChannelMessage;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BroadcastError, MessageBus};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct TopicBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
    capacity: usize,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TopicBus {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { topics: Arc::new(RwLock::new(HashMap::new())), capacity: capacity.max(1) }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver `message` to every current subscriber of `topic`. Returns how
    /// many receivers it reached; topics nobody listens to are dropped.
    pub fn deliver(&self, topic: &str, message: ChannelMessage) -> usize {
        let delivered = {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic) {
                Some(sender) => sender.send(message).ok(),
                None => return 0,
            }
        };

        match delivered {
            Some(count) => {
                trace!(topic, receivers = count, "published");
                count
            }
            None => {
                self.prune(topic);
                0
            }
        }
    }

    pub fn receiver_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, broadcast::Sender::receiver_count)
    }

    /// Forget `topic` once its last receiver is gone.
    pub fn prune(&self, topic: &str) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.get(topic).is_some_and(|sender| sender.receiver_count() == 0) {
            topics.remove(topic);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `message` on every open topic.
    pub fn send_all(&self, message: ChannelMessage) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.values().filter_map(|sender| sender.send(message.clone()).ok()).sum()
    }
}

#[async_trait]
impl MessageBus for TopicBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage> {
        TopicBus::subscribe(self, topic)
    }

    async fn publish(&self, topic: &str, message: ChannelMessage) -> Result<usize, BroadcastError> {
        Ok(self.deliver(topic, message))
    }

    fn prune(&self, topic: &str) {
        TopicBus::prune(self, topic);
    }
}
