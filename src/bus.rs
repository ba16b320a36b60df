//! Bus seam
//!
//! The engine consumes the robotics bus through [`BusEndpoint`]: each
//! subscription is a lazy, unbounded, in-order sequence of raw payloads,
//! restartable only by re-subscribing. Host processes provide the real bus
//! adapter; [`LocalBus`] is the in-process implementation used by the
//! binary's loopback mode and the test suite.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Bus operation failure.
#[derive(Debug, Clone)]
pub struct BusError(pub String);

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus error: {}", self.0)
    }
}

impl std::error::Error for BusError {}

/// Publish/subscribe access to the robotics bus.
///
/// Implementations deliver each subscription's messages in arrival order;
/// ordering across topics is not required.
#[async_trait]
pub trait BusEndpoint: Send + Sync {
    /// Subscribe to a bus topic. Messages arrive as raw serialized payloads
    /// to be decoded by the bridge's payload codec.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Bytes>, BusError>;

    /// Publish a raw serialized payload to a bus topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;
}

/// Per-subscription channel capacity. Matches the default queue depth the
/// bus side would use for a sensor topic.
const SUBSCRIPTION_QUEUE: usize = 64;

/// In-process bus: topic -> subscriber channels.
#[derive(Default)]
pub struct LocalBus {
    topics: DashMap<String, Vec<mpsc::Sender<Bytes>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a topic (test/introspection helper).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusEndpoint for LocalBus {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let senders = match self.topics.get(topic) {
            Some(senders) => senders.clone(),
            None => return Ok(()),
        };

        for sender in &senders {
            // A full or closed subscriber drops the message for that
            // subscriber only; the bus never blocks the publisher.
            let _ = sender.try_send(payload.clone());
        }

        // Prune closed subscribers so the topic entry doesn't grow forever.
        if senders.iter().any(|s| s.is_closed()) {
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.retain(|s| !s.is_closed());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_subscriber() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("/gps/fix").await.unwrap();

        for i in 0..5u8 {
            bus.publish("/gps/fix", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        bus.publish("/nobody", Bytes::from_static(b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn fan_out_to_multiple_subscribers() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("/odom").await.unwrap();
        let mut b = bus.subscribe("/odom").await.unwrap();

        bus.publish("/odom", Bytes::from_static(b"m")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"m"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"m"));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("/scan").await.unwrap();
        drop(rx);

        bus.publish("/scan", Bytes::from_static(b"m")).await.unwrap();
        assert_eq!(bus.subscriber_count("/scan"), 0);
    }
}
