//!
//! Live-update bus
//! ---------------
//! Fire-and-forget pub/sub keyed by topic string (one topic per table
//! identity). Publishing after a mutation wakes every live listener, which
//! then re-reads current state on its own; the signal carries no payload
//! and no delivery guarantee. Each subscriber gets a bounded queue: a slow
//! listener drops signals, which is fine since a later signal re-derives
//! the same state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

const SUBSCRIBER_QUEUE: usize = 16;

/// Shared topic registry. Clones are handles onto the same bus.
#[derive(Clone, Default)]
pub struct Broadcast {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

impl Broadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every subscriber of a topic. No-op when nobody listens.
    pub fn publish(&self, topic: &str) {
        let topics = self.topics.read();
        if let Some(sender) = topics.get(topic) {
            // Err means zero receivers, which is not a failure here.
            let delivered = sender.send(()).unwrap_or(0);
            debug!(target: "gridbase::broadcast", "publish: topic='{}' receivers={}", topic, delivered);
        }
    }

    /// Subscribe to a topic, creating it on first use. Dropping the
    /// returned receiver unsubscribes.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<()> {
        let mut topics = self.topics.write();
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_QUEUE).0);
        sender.subscribe()
    }

    /// Drop topics whose last subscriber disconnected.
    pub fn prune(&self) {
        let mut topics = self.topics.write();
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}
