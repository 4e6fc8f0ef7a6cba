use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport subscription closed")]
    Closed,
    #[error("transport unreachable: {0}")]
    Unreachable(String),
}

/// Raw pub/sub transport the bus client runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Liveness check used by `connect`.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Deliver `payload` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Release the underlying connection.
    async fn close(&self);
}

/// A live subscription to one topic. Dropping it unsubscribes.
#[async_trait]
pub trait Subscription: Send {
    /// Next raw payload. An error means the subscription is dead and has to
    /// be re-established.
    async fn next_message(&mut self) -> Result<String, TransportError>;
}

/// In-memory pub/sub for single-node deployments.
pub struct MemoryTransport {
    /// Topic → broadcast sender.
    topics: DashMap<String, broadcast::Sender<Arc<str>>>,
    /// Buffer size for broadcast channels.
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Tear down every live subscription of `topic`. Subscribers observe a
    /// closed subscription once they drain what was already buffered.
    pub fn drop_subscribers(&self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Unreachable("transport closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(tx) = self.topics.get(topic) {
            // send() only fails when nobody is listening
            let _ = tx.send(Arc::from(payload));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.ensure_open()?;
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.topics.clear();
    }
}

struct MemorySubscription {
    topic: String,
    rx: broadcast::Receiver<Arc<str>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<String, TransportError> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(payload.to_string()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged = n, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let transport = MemoryTransport::new(16);
        let mut a = transport.subscribe("t").await.unwrap();
        let mut b = transport.subscribe("t").await.unwrap();

        transport.publish("t", "hello".to_string()).await.unwrap();

        assert_eq!(a.next_message().await.unwrap(), "hello");
        assert_eq!(b.next_message().await.unwrap(), "hello");
        assert_eq!(transport.subscriber_count("t"), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let transport = MemoryTransport::new(16);
        transport.publish("nobody", "x".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_subscribers_closes_subscription() {
        let transport = MemoryTransport::new(16);
        let mut sub = transport.subscribe("t").await.unwrap();

        transport.drop_subscribers("t");

        assert_eq!(sub.next_message().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_everything() {
        let transport = MemoryTransport::new(16);
        transport.close().await;

        assert!(transport.ping().await.is_err());
        assert!(transport.publish("t", "x".to_string()).await.is_err());
        assert!(transport.subscribe("t").await.is_err());
    }
}
