use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Default topic for hybrid cache invalidation traffic.
pub const INVALIDATION_TOPIC: &str = "cache:invalidate";

const CHANNEL_CAPACITY: usize = 1024;

/// Callback invoked for each message received on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fire-and-forget publish/subscribe collaborator used by the hybrid tier.
///
/// Message handling is single-threaded per subscription: the handler is
/// awaited for each message before the next is delivered.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: Value) -> Result<()>;

    /// Register `handler` for `topic`. The returned handle owns the delivery
    /// task; aborting it ends the subscription.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<JoinHandle<()>>;
}

/// Broadcast payload that tells peers to drop their local copies.
///
/// A key ending in `*` requests prefix removal. `expired` marks messages
/// caused by local expiration rather than an overt write, letting receivers
/// evict without re-notifying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Unique id of the publishing engine, used to filter echoes.
    pub origin_id: String,
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub flush_all: bool,
    #[serde(default)]
    pub expired: bool,
}

impl InvalidationMessage {
    #[must_use]
    pub fn for_keys(origin_id: impl Into<String>, keys: Vec<String>, expired: bool) -> Self {
        Self {
            origin_id: origin_id.into(),
            keys: Some(keys),
            flush_all: false,
            expired,
        }
    }

    #[must_use]
    pub fn flush_all(origin_id: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            keys: None,
            flush_all: true,
            expired: false,
        }
    }
}

/// In-process bus backed by per-topic broadcast channels.
///
/// Lets multiple hybrid peers converge inside one process, which is also how
/// the echo-suppression tests run several engines side by side.
pub struct InMemoryMessageBus {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl InMemoryMessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, message: Value) -> Result<()> {
        // no receivers is fine for fire-and-forget delivery
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<JoinHandle<()>> {
        let mut rx = self.sender(topic).subscribe();
        let topic = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic, "topic closed, ending subscription");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InMemoryMessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler: MessageHandler = Arc::new(move |msg| -> BoxFuture<'static, ()> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        });
        let handle = bus.subscribe("test-topic", handler).await.unwrap();

        bus.publish("test-topic", json!({"n": 1})).await.unwrap();
        bus.publish("other-topic", json!({"n": 2})).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, json!({"n": 1}));
        // nothing from the other topic
        assert!(rx.try_recv().is_err());

        handle.abort();
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryMessageBus::new();
        bus.publish("nobody", json!(null)).await.unwrap();
    }

    #[test]
    fn invalidation_message_round_trips() {
        let msg = InvalidationMessage::for_keys("engine-1", vec!["a".into(), "p:*".into()], true);
        let json = serde_json::to_value(&msg).unwrap();
        let back: InvalidationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin_id, "engine-1");
        assert_eq!(back.keys.as_deref(), Some(&["a".to_string(), "p:*".to_string()][..]));
        assert!(back.expired);
        assert!(!back.flush_all);

        let flush = InvalidationMessage::flush_all("engine-2");
        assert!(flush.flush_all);
        assert!(flush.keys.is_none());
    }
}
