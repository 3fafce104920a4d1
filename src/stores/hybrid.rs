use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::messaging::{InvalidationMessage, MessageBus, MessageHandler, INVALIDATION_TOPIC};
use crate::stores::memory::InMemoryCache;
use crate::value::CacheValue;
use crate::{CacheClient, RawValue};

/// Best-effort invalidation broadcast; delivery failures are logged, the
/// write itself has already succeeded.
async fn publish_invalidation(
    bus: &Arc<dyn MessageBus>,
    topic: &str,
    message: InvalidationMessage,
) {
    let payload = match serde_json::to_value(&message) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to encode invalidation message");
            return;
        }
    };
    if let Err(err) = bus.publish(topic, payload).await {
        warn!(error = %err, topic = %topic, "failed to publish invalidation");
    }
}

/// Configures a [`HybridCache`].
pub struct HybridCacheBuilder {
    local: Option<InMemoryCache>,
    topic: String,
}

impl HybridCacheBuilder {
    fn new() -> Self {
        Self {
            local: None,
            topic: INVALIDATION_TOPIC.to_string(),
        }
    }

    /// Use a pre-configured local engine instead of an unbounded default.
    #[must_use]
    pub fn local(mut self, local: InMemoryCache) -> Self {
        self.local = Some(local);
        self
    }

    /// Invalidation topic; peers must agree on it.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Subscribes to the invalidation topic and wires the local engine's
    /// expiration events to outbound invalidations.
    pub async fn build(
        self,
        remote: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<HybridCache> {
        let local = self.local.unwrap_or_default();
        let topic = self.topic;
        // fresh id per engine instance so in-process peers can tell their
        // own messages apart
        let instance_id = Uuid::new_v4().to_string();
        let invalidations = Arc::new(AtomicU64::new(0));

        let handler: MessageHandler = {
            let local = local.clone();
            let instance_id = instance_id.clone();
            let invalidations = invalidations.clone();
            Arc::new(move |payload: Value| -> BoxFuture<'static, ()> {
                let local = local.clone();
                let instance_id = instance_id.clone();
                let invalidations = invalidations.clone();
                Box::pin(async move {
                    let message: InvalidationMessage = match serde_json::from_value(payload) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "dropping malformed invalidation message");
                            return;
                        }
                    };
                    if message.origin_id == instance_id {
                        debug!("ignoring invalidation echo");
                        return;
                    }
                    invalidations.fetch_add(1, Ordering::Relaxed);
                    apply_invalidation(&local, &message).await;
                })
            })
        };
        let subscription = bus.subscribe(&topic, handler).await?;

        // forward local expirations so peers converge
        let forwarder = {
            let mut rx = local.subscribe_expirations();
            let bus = bus.clone();
            let topic = topic.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if !event.send_notification {
                                continue;
                            }
                            publish_invalidation(
                                &bus,
                                &topic,
                                InvalidationMessage::for_keys(
                                    instance_id.clone(),
                                    vec![event.key],
                                    true,
                                ),
                            )
                            .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "expiration forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Ok(HybridCache {
            local,
            remote,
            bus,
            topic,
            instance_id,
            local_hits: AtomicU64::new(0),
            invalidations,
            tasks: vec![subscription, forwarder],
        })
    }
}

/// Apply one received invalidation to the local engine.
async fn apply_invalidation(local: &InMemoryCache, message: &InvalidationMessage) {
    if message.flush_all {
        if let Err(err) = local.remove_all(None).await {
            warn!(error = %err, "failed to apply flush-all invalidation");
        }
        return;
    }
    let Some(keys) = &message.keys else {
        return;
    };
    for key in keys {
        let outcome = if let Some(prefix) = key.strip_suffix('*') {
            local.remove_by_prefix(prefix).await.map(|_| ())
        } else if message.expired {
            // the peer already broadcast this expiry, do not echo it back
            local.remove_as_expired(key, false);
            Ok(())
        } else {
            local.remove(key).await.map(|_| ())
        };
        if let Err(err) = outcome {
            warn!(error = %err, key = %key, "failed to apply invalidation");
        }
    }
}

/// Two-tier cache: a local in-process engine in front of a shared remote
/// cache, kept coherent through pub/sub invalidation.
///
/// Reads probe the local engine first and fall back to the remote tier,
/// populating the local copy with the remote's remaining TTL. Every write
/// flows through to the remote cache and then broadcasts an invalidation
/// carrying this engine's instance id; peers evict their local copies while
/// the writer ignores its own echo.
pub struct HybridCache {
    local: InMemoryCache,
    remote: Arc<dyn CacheClient>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    instance_id: String,
    local_hits: AtomicU64,
    invalidations: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl HybridCache {
    #[must_use]
    pub fn builder() -> HybridCacheBuilder {
        HybridCacheBuilder::new()
    }

    /// Hybrid cache with an unbounded local engine and the default topic.
    pub async fn new(remote: Arc<dyn CacheClient>, bus: Arc<dyn MessageBus>) -> Result<Self> {
        Self::builder().build(remote, bus).await
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn local(&self) -> &InMemoryCache {
        &self.local
    }

    /// Reads served from the local tier.
    #[must_use]
    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    /// Invalidations received from peers (echoes excluded).
    #[must_use]
    pub fn invalidations_received(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Stop message handling and dispose the owned local engine. The remote
    /// cache is shared and left untouched.
    pub fn dispose(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.local.dispose();
    }

    async fn publish_keys(&self, keys: Vec<String>, expired: bool) {
        publish_invalidation(
            &self.bus,
            &self.topic,
            InvalidationMessage::for_keys(self.instance_id.clone(), keys, expired),
        )
        .await;
    }

    async fn publish_flush(&self) {
        publish_invalidation(
            &self.bus,
            &self.topic,
            InvalidationMessage::flush_all(self.instance_id.clone()),
        )
        .await;
    }

    /// Write through to the remote tier, drop the local copy, broadcast.
    /// Used by operations whose result the remote computes (numerics,
    /// lists, conditional updates).
    async fn invalidate_after_remote(&self, key: &str) {
        let _ = self.local.remove(key).await;
        self.publish_keys(vec![key.to_string()], false).await;
    }
}

impl Drop for HybridCache {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl CacheClient for HybridCache {
    fn strict_serialization(&self) -> bool {
        self.local.strict_serialization() || self.remote.strict_serialization()
    }

    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>> {
        match self.local.get_raw(key).await? {
            CacheValue::Missing => {}
            hit => {
                self.local_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }
        match self.remote.get_raw(key).await? {
            CacheValue::Missing => Ok(CacheValue::Missing),
            CacheValue::Null => {
                let ttl = self.remote.get_expiration(key).await?;
                let _ = self.local.set_raw(key, Value::Null, ttl).await;
                Ok(CacheValue::Null)
            }
            CacheValue::Value(raw) => {
                let ttl = self.remote.get_expiration(key).await?;
                let _ = self.local.set_raw(key, raw.as_ref().clone(), ttl).await;
                Ok(CacheValue::Value(raw))
            }
        }
    }

    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert((*key).to_string(), self.get_raw(key).await?);
        }
        Ok(out)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.local.exists(key).await? {
            return Ok(true);
        }
        self.remote.exists(key).await
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        if let Some(remaining) = self.local.get_expiration(key).await? {
            return Ok(Some(remaining));
        }
        self.remote.get_expiration(key).await
    }

    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>> {
        self.remote.get_all_expirations(keys).await
    }

    async fn set_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let written = self.remote.set_raw(key, value.clone(), ttl).await?;
        let _ = self.local.set_raw(key, value, ttl).await;
        self.publish_keys(vec![key.to_string()], false).await;
        Ok(written)
    }

    async fn add_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let added = self.remote.add_raw(key, value.clone(), ttl).await?;
        if added {
            let _ = self.local.set_raw(key, value, ttl).await;
            self.publish_keys(vec![key.to_string()], false).await;
        }
        Ok(added)
    }

    async fn replace_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let replaced = self.remote.replace_raw(key, value.clone(), ttl).await?;
        if replaced {
            let _ = self.local.set_raw(key, value, ttl).await;
            self.publish_keys(vec![key.to_string()], false).await;
        }
        Ok(replaced)
    }

    async fn replace_if_equal_raw(
        &self,
        key: &str,
        value: Value,
        expected: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let replaced = self
            .remote
            .replace_if_equal_raw(key, value, expected, ttl)
            .await?;
        if replaced {
            self.invalidate_after_remote(key).await;
        }
        Ok(replaced)
    }

    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let keys: Vec<String> = items.keys().cloned().collect();
        let written = self.remote.set_all_raw(items.clone(), ttl).await?;
        let _ = self.local.set_all_raw(items, ttl).await;
        self.publish_keys(keys, false).await;
        Ok(written)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let removed = self.remote.remove(key).await?;
        let _ = self.local.remove(key).await;
        self.publish_keys(vec![key.to_string()], false).await;
        Ok(removed)
    }

    async fn remove_if_equal_raw(&self, key: &str, expected: Value) -> Result<bool> {
        let removed = self.remote.remove_if_equal_raw(key, expected).await?;
        if removed {
            self.invalidate_after_remote(key).await;
        }
        Ok(removed)
    }

    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize> {
        let removed = self.remote.remove_all(keys).await?;
        let _ = self.local.remove_all(keys).await;
        match keys {
            None | Some([]) => self.publish_flush().await,
            Some(keys) => {
                self.publish_keys(keys.iter().map(|k| (*k).to_string()).collect(), false)
                    .await;
            }
        }
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self.remote.remove_by_prefix(prefix).await?;
        let _ = self.local.remove_by_prefix(prefix).await;
        // a trailing star makes peers apply this as a prefix removal
        self.publish_keys(vec![format!("{prefix}*")], false).await;
        Ok(removed)
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let value = self.remote.increment(key, amount, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(value)
    }

    async fn increment_float(&self, key: &str, amount: f64, ttl: Option<Duration>) -> Result<f64> {
        let value = self.remote.increment_float(key, amount, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(value)
    }

    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        let diff = self.remote.set_if_higher(key, value, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(diff)
    }

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        let diff = self.remote.set_if_higher_float(key, value, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(diff)
    }

    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        let diff = self.remote.set_if_lower(key, value, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(diff)
    }

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        let diff = self.remote.set_if_lower_float(key, value, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(diff)
    }

    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let added = self.remote.list_add_raw(key, values, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(added)
    }

    async fn list_remove_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let removed = self.remote.list_remove_raw(key, values, ttl).await?;
        self.invalidate_after_remote(key).await;
        Ok(removed)
    }

    async fn get_list_raw(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>> {
        match self.local.get_list_raw(key, page, page_size).await? {
            CacheValue::Missing => {}
            hit => {
                self.local_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }
        // fetch the full remote list so the local copy is complete
        match self.remote.get_list_raw(key, None, page_size).await? {
            CacheValue::Missing => Ok(CacheValue::Missing),
            CacheValue::Null => Ok(CacheValue::Null),
            CacheValue::Value(items) => {
                let ttl = self.remote.get_expiration(key).await?;
                let values: Vec<Value> = items.iter().map(|v| v.as_ref().clone()).collect();
                let _ = self.local.list_add_raw(key, values, ttl).await;
                let paged = match page {
                    None => items,
                    Some(p) => items
                        .into_iter()
                        .skip((p - 1) * page_size)
                        .take(page_size)
                        .collect(),
                };
                Ok(CacheValue::Value(paged))
            }
        }
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        self.remote.set_expiration(key, ttl).await?;
        let _ = self.local.set_expiration(key, ttl).await;
        self.publish_keys(vec![key.to_string()], false).await;
        Ok(())
    }

    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()> {
        let keys: Vec<String> = expirations.keys().cloned().collect();
        self.remote.set_all_expirations(expirations.clone()).await?;
        let _ = self.local.set_all_expirations(expirations).await;
        self.publish_keys(keys, false).await;
        Ok(())
    }
}

/// Decorator for services that write to the shared remote cache but keep no
/// local copy of their own: every write still publishes an invalidation so
/// hybrid peers evict theirs. Reads go straight to the remote cache.
pub struct HybridAwareCache {
    remote: Arc<dyn CacheClient>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    instance_id: String,
}

impl HybridAwareCache {
    #[must_use]
    pub fn new(remote: Arc<dyn CacheClient>, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_topic(remote, bus, INVALIDATION_TOPIC)
    }

    #[must_use]
    pub fn with_topic(
        remote: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            bus,
            topic: topic.into(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish_keys(&self, keys: Vec<String>) {
        publish_invalidation(
            &self.bus,
            &self.topic,
            InvalidationMessage::for_keys(self.instance_id.clone(), keys, false),
        )
        .await;
    }
}

#[async_trait]
impl CacheClient for HybridAwareCache {
    fn strict_serialization(&self) -> bool {
        self.remote.strict_serialization()
    }

    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>> {
        self.remote.get_raw(key).await
    }

    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>> {
        self.remote.get_all_raw(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.remote.exists(key).await
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        self.remote.get_expiration(key).await
    }

    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>> {
        self.remote.get_all_expirations(keys).await
    }

    async fn set_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let written = self.remote.set_raw(key, value, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(written)
    }

    async fn add_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let added = self.remote.add_raw(key, value, ttl).await?;
        if added {
            self.publish_keys(vec![key.to_string()]).await;
        }
        Ok(added)
    }

    async fn replace_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let replaced = self.remote.replace_raw(key, value, ttl).await?;
        if replaced {
            self.publish_keys(vec![key.to_string()]).await;
        }
        Ok(replaced)
    }

    async fn replace_if_equal_raw(
        &self,
        key: &str,
        value: Value,
        expected: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let replaced = self
            .remote
            .replace_if_equal_raw(key, value, expected, ttl)
            .await?;
        if replaced {
            self.publish_keys(vec![key.to_string()]).await;
        }
        Ok(replaced)
    }

    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let keys: Vec<String> = items.keys().cloned().collect();
        let written = self.remote.set_all_raw(items, ttl).await?;
        self.publish_keys(keys).await;
        Ok(written)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let removed = self.remote.remove(key).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(removed)
    }

    async fn remove_if_equal_raw(&self, key: &str, expected: Value) -> Result<bool> {
        let removed = self.remote.remove_if_equal_raw(key, expected).await?;
        if removed {
            self.publish_keys(vec![key.to_string()]).await;
        }
        Ok(removed)
    }

    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize> {
        let removed = self.remote.remove_all(keys).await?;
        match keys {
            None | Some([]) => {
                publish_invalidation(
                    &self.bus,
                    &self.topic,
                    InvalidationMessage::flush_all(self.instance_id.clone()),
                )
                .await;
            }
            Some(keys) => {
                self.publish_keys(keys.iter().map(|k| (*k).to_string()).collect())
                    .await;
            }
        }
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self.remote.remove_by_prefix(prefix).await?;
        self.publish_keys(vec![format!("{prefix}*")]).await;
        Ok(removed)
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let value = self.remote.increment(key, amount, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(value)
    }

    async fn increment_float(&self, key: &str, amount: f64, ttl: Option<Duration>) -> Result<f64> {
        let value = self.remote.increment_float(key, amount, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(value)
    }

    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        let diff = self.remote.set_if_higher(key, value, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(diff)
    }

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        let diff = self.remote.set_if_higher_float(key, value, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(diff)
    }

    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        let diff = self.remote.set_if_lower(key, value, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(diff)
    }

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        let diff = self.remote.set_if_lower_float(key, value, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(diff)
    }

    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let added = self.remote.list_add_raw(key, values, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(added)
    }

    async fn list_remove_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let removed = self.remote.list_remove_raw(key, values, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(removed)
    }

    async fn get_list_raw(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>> {
        self.remote.get_list_raw(key, page, page_size).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        self.remote.set_expiration(key, ttl).await?;
        self.publish_keys(vec![key.to_string()]).await;
        Ok(())
    }

    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()> {
        let keys: Vec<String> = expirations.keys().cloned().collect();
        self.remote.set_all_expirations(expirations).await?;
        self.publish_keys(keys).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryMessageBus;
    use crate::CacheClientExt;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    struct Peers {
        remote: Arc<InMemoryCache>,
        a: HybridCache,
        b: HybridCache,
    }

    async fn peers() -> Peers {
        let remote = Arc::new(InMemoryCache::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let a = HybridCache::new(remote.clone(), bus.clone()).await.unwrap();
        let b = HybridCache::new(remote.clone(), bus.clone()).await.unwrap();
        Peers { remote, a, b }
    }

    #[tokio::test]
    async fn writes_reach_remote_and_local() {
        let peers = peers().await;
        peers.a.set("x", &1_u64, None).await.unwrap();

        assert_eq!(
            peers.remote.get::<u64>("x").await.unwrap().into_value(),
            Some(1)
        );
        assert_eq!(
            peers.a.local().get::<u64>("x").await.unwrap().into_value(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn local_miss_populates_from_remote() {
        let peers = peers().await;
        peers
            .remote
            .set("x", &7_u64, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(peers.b.get::<u64>("x").await.unwrap().into_value(), Some(7));
        // now cached locally, with the remote's remaining ttl
        assert_eq!(
            peers.b.local().get::<u64>("x").await.unwrap().into_value(),
            Some(7)
        );
        let remaining = peers.b.local().get_expiration("x").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));

        assert_eq!(peers.b.local_hits(), 0);
        let _ = peers.b.get::<u64>("x").await.unwrap();
        assert_eq!(peers.b.local_hits(), 1);
    }

    #[tokio::test]
    async fn peer_write_evicts_local_copy_without_self_eviction() {
        let peers = peers().await;

        peers.a.set("x", &1_u64, None).await.unwrap();
        assert_eq!(peers.b.get::<u64>("x").await.unwrap().into_value(), Some(1));
        settle().await;

        peers.a.set("x", &2_u64, None).await.unwrap();
        settle().await;

        // B's stale local copy is gone and the next read refetches
        assert!(peers.b.local().get::<u64>("x").await.unwrap().is_missing());
        assert_eq!(peers.b.get::<u64>("x").await.unwrap().into_value(), Some(2));

        // A ignored its own echo and kept its local copy
        assert_eq!(
            peers.a.local().get::<u64>("x").await.unwrap().into_value(),
            Some(2)
        );
        assert_eq!(peers.a.invalidations_received(), 0);
        assert!(peers.b.invalidations_received() >= 1);
    }

    #[tokio::test]
    async fn flush_all_propagates() {
        let peers = peers().await;
        peers.a.set("x", &1_u64, None).await.unwrap();
        peers.b.get::<u64>("x").await.unwrap();
        settle().await;

        peers.a.remove_all(None).await.unwrap();
        settle().await;

        assert!(peers.b.local().get::<u64>("x").await.unwrap().is_missing());
        assert!(peers.b.get::<u64>("x").await.unwrap().is_missing());
    }

    #[tokio::test]
    async fn prefix_invalidation_uses_star_suffix() {
        let peers = peers().await;
        peers.a.set("user:1", &1_u64, None).await.unwrap();
        peers.a.set("other", &2_u64, None).await.unwrap();
        // drain the set invalidations before populating B's local tier
        settle().await;
        peers.b.get::<u64>("user:1").await.unwrap();
        peers.b.get::<u64>("other").await.unwrap();

        peers.a.remove_by_prefix("user:").await.unwrap();
        settle().await;

        assert!(peers.b.local().get::<u64>("user:1").await.unwrap().is_missing());
        assert_eq!(
            peers.b.local().get::<u64>("other").await.unwrap().into_value(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn increment_invalidates_peers() {
        let peers = peers().await;
        peers.a.set("n", &10_i64, None).await.unwrap();
        assert_eq!(peers.b.get::<i64>("n").await.unwrap().into_value(), Some(10));
        settle().await;

        assert_eq!(peers.b.increment("n", 5, None).await.unwrap(), 15);
        settle().await;

        assert_eq!(peers.a.get::<i64>("n").await.unwrap().into_value(), Some(15));
        assert_eq!(peers.b.get::<i64>("n").await.unwrap().into_value(), Some(15));
    }

    #[tokio::test]
    async fn local_expiration_broadcasts_to_peers() {
        let remote = Arc::new(InMemoryCache::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let a = HybridCache::new(remote.clone(), bus.clone())
            .await
            .unwrap();
        let b = HybridCache::new(remote.clone(), bus.clone())
            .await
            .unwrap();

        a.set("x", &1_u64, Some(Duration::from_millis(80))).await.unwrap();
        assert_eq!(b.get::<u64>("x").await.unwrap().into_value(), Some(1));

        // wait out the ttl, then trip A's read path to reap and broadcast
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.local().get::<u64>("x").await.unwrap().is_missing());
        settle().await;

        assert!(b.local().get::<u64>("x").await.unwrap().is_missing());
        assert!(b.invalidations_received() >= 1);
    }

    #[tokio::test]
    async fn hybrid_aware_writes_invalidate_hybrid_peers() {
        let remote = Arc::new(InMemoryCache::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let hybrid = HybridCache::new(remote.clone(), bus.clone())
            .await
            .unwrap();
        let aware = HybridAwareCache::new(remote.clone(), bus.clone());

        hybrid.set("x", &1_u64, None).await.unwrap();
        settle().await;

        aware.set("x", &2_u64, None).await.unwrap();
        settle().await;

        // the hybrid peer dropped its local copy and refetches the new value
        assert!(hybrid.local().get::<u64>("x").await.unwrap().is_missing());
        assert_eq!(hybrid.get::<u64>("x").await.unwrap().into_value(), Some(2));

        // reads on the aware decorator go straight to the remote
        assert_eq!(aware.get::<u64>("x").await.unwrap().into_value(), Some(2));
    }

    #[tokio::test]
    async fn dispose_stops_message_handling() {
        let peers = peers().await;
        peers.a.set("x", &1_u64, None).await.unwrap();
        peers.b.get::<u64>("x").await.unwrap();
        settle().await;

        peers.b.dispose();
        assert!(peers.b.local.get_raw("x").await.is_err());

        // publishing after dispose must not panic the subscriber task
        peers.a.set("x", &2_u64, None).await.unwrap();
        settle().await;
    }

    #[tokio::test]
    async fn get_list_populates_local() {
        let peers = peers().await;
        peers
            .remote
            .list_add("l", &["a", "b", "c"], None)
            .await
            .unwrap();

        let items = peers
            .b
            .get_list::<String>("l", None, 100)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(items.len(), 3);

        let local_items = peers
            .b
            .local()
            .get_list::<String>("l", None, 100)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(local_items.len(), 3);
    }
}
