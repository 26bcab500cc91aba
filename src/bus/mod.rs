//! Topic-scoped publish/subscribe fan-out.
//!
//! Each topic gets its own bounded broadcast channel. A slow subscriber
//! that falls behind the channel's capacity does not block the publisher
//! or other subscribers — messages it cannot keep up with are dropped and
//! its next receive surfaces a [`RecvError::Lagged`], which callers turn
//! into the `lagged`/`resync_required` signal described in the transport
//! contract. Delivery is therefore at-least-once and ordering is preserved
//! per (topic, subscriber), but a lagged subscriber may skip messages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::telemetry::events::record_subscriber_lagged;

pub use broadcast::error::RecvError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(pub String);

impl Topic {
    pub fn session(session_id: &str) -> Self {
        Topic(format!("session:{session_id}"))
    }

    pub fn jobs() -> Self {
        Topic("jobs".to_string())
    }

    pub fn note(note_id: &str) -> Self {
        Topic(format!("note:{note_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A bounded, topic-scoped publish/subscribe bus.
///
/// `T` is the event payload type; it must be cheaply `Clone` (an `Arc`
/// wrapper is the usual choice for anything non-trivial to copy).
pub struct MessageBus<T: Clone + Send + Sync + 'static> {
    capacity: usize,
    topics: RwLock<HashMap<Topic, broadcast::Sender<T>>>,
}

pub struct Subscription<T: Clone + Send + Sync + 'static> {
    topic: Topic,
    subscriber_id: String,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    /// Receives the next message, transparently surfacing a `lagged`
    /// telemetry event and continuing past the gap rather than returning
    /// the lag as an error to the caller — callers that need to react to
    /// a resync should use [`Subscription::try_recv_raw`] instead.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    record_subscriber_lagged(self.topic.as_str(), &self.subscriber_id, skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receives the next message without masking a lag, so the caller can
    /// emit an explicit `resync_required` frame.
    pub async fn recv_raw(&mut self) -> Result<T, RecvError> {
        self.receiver.recv().await
    }
}

impl<T: Clone + Send + Sync + 'static> MessageBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &Topic) -> broadcast::Sender<T> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publishes a message to every current subscriber of `topic`. Returns
    /// the number of subscribers that received it (zero is not an error —
    /// topics with no subscribers simply drop the message).
    pub async fn publish(&self, topic: &Topic, message: T) -> usize {
        let sender = self.sender_for(topic).await;
        sender.send(message).unwrap_or(0)
    }

    pub async fn subscribe(&self, topic: &Topic, subscriber_id: impl Into<String>) -> Subscription<T> {
        let sender = self.sender_for(topic).await;
        Subscription {
            topic: topic.clone(),
            subscriber_id: subscriber_id.into(),
            receiver: sender.subscribe(),
        }
    }

    /// Drops the topic's sender once no subscribers remain, so idle
    /// session topics do not accumulate forever in the map.
    pub async fn sweep_idle_topics(&self) {
        let mut topics = self.topics.write().await;
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers_in_order() {
        let bus: MessageBus<i32> = MessageBus::new(8);
        let topic = Topic::session("s1");
        let mut sub_a = bus.subscribe(&topic, "a").await;
        let mut sub_b = bus.subscribe(&topic, "b").await;

        bus.publish(&topic, 1).await;
        bus.publish(&topic, 2).await;

        assert_eq!(sub_a.recv().await, Some(1));
        assert_eq!(sub_a.recv().await, Some(2));
        assert_eq!(sub_b.recv().await, Some(1));
        assert_eq!(sub_b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_instead_of_blocking_publisher() {
        let bus: MessageBus<i32> = MessageBus::new(2);
        let topic = Topic::session("s1");
        let mut sub = bus.subscribe(&topic, "slow").await;

        for value in 0..10 {
            bus.publish(&topic, value).await;
        }

        // The bounded channel dropped the earliest values; recv() skips
        // the lag transparently and returns the most recent surviving ones.
        let received = sub.recv().await.expect("message after lag");
        assert!(received >= 7, "expected a recent value, got {received}");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let bus: MessageBus<i32> = MessageBus::new(4);
        let topic = Topic::jobs();
        let delivered = bus.publish(&topic, 42).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn sweep_idle_topics_drops_unsubscribed_entries() {
        let bus: MessageBus<i32> = MessageBus::new(4);
        let topic = Topic::session("s1");
        {
            let _sub = bus.subscribe(&topic, "a").await;
            assert_eq!(bus.subscriber_count(&topic).await, 1);
        }
        bus.sweep_idle_topics().await;
        assert_eq!(bus.subscriber_count(&topic).await, 0);
    }
}
