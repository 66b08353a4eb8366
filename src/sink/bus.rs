//! In-process message bus of named broadcast channels.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::detect::AnomalyEvent;

/// A batch as seen by bus subscribers.
pub type Published = Arc<Vec<AnomalyEvent>>;

/// Named `broadcast` channels, created on first use.
#[derive(Clone)]
pub struct MessageBus {
    channels: Arc<DashMap<String, broadcast::Sender<Published>>>,
    capacity: usize,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Published> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Published> {
        self.sender(channel).subscribe()
    }

    /// Publish to `channel`. Returns the number of receivers reached; zero
    /// means nobody was listening.
    pub fn publish(&self, channel: &str, batch: Published) -> usize {
        self.sender(channel).send(batch).unwrap_or(0)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
