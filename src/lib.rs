/*!
Typed in-process cache engine with TTLs, size-aware eviction, and hybrid
two-tier invalidation.

The crate is built around two traits:

- [`CacheClient`] is the object-safe contract every store implements. It
  operates on [`RawValue`] payloads (reference-counted JSON values) so stores
  and decorators compose over `Arc<dyn CacheClient>`.
- [`CacheClientExt`] adds the typed surface (`get::<T>`, `set`, `list_add`,
  ...) on top of any `CacheClient`, (de)serializing at the boundary.

Stores:

- [`InMemoryCache`]: concurrent engine with per-key expiration, atomic
  numeric and list operations, bounded capacity with size-aware eviction,
  and expiration notifications.
- [`HybridCache`]: two-tier composition of a local engine, a remote cache,
  and a pub/sub invalidation channel.
- [`ScopedCache`]: key-prefix decorator.
- [`HybridAwareCache`]: remote-only decorator that still publishes
  invalidations for hybrid peers.
- [`NullCache`]: no-op collaborator default.

```rust
use tiercache::{CacheClientExt, InMemoryCache};

# async fn demo() -> tiercache::Result<()> {
let cache = InMemoryCache::builder().max_items(10_000).build()?;

cache.set("user:1", &42_u64, None).await?;
assert_eq!(cache.get::<u64>("user:1").await?.into_value(), Some(42));
# Ok(())
# }
```

TTL arguments are `Option<Duration>`: `None` means no expiration (each
operation documents its per-operation nuance), a positive duration sets
expiry, and `Duration::ZERO` deletes the key the way a non-positive span
does in distributed backends.
*/

pub mod clock;
mod entry;
pub mod error;
pub mod messaging;
pub mod size;
pub mod stores;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::error::{CacheError, Result};
pub use crate::messaging::{
    InMemoryMessageBus, InvalidationMessage, MessageBus, MessageHandler, INVALIDATION_TOPIC,
};
pub use crate::size::{SizeCalculator, SizeFn};
pub use crate::stores::{
    ExpiredEntry, HybridAwareCache, HybridCache, HybridCacheBuilder, InMemoryCache,
    InMemoryCacheBuilder, NullCache, ScopedCache,
};
pub use crate::value::CacheValue;

/// Reference-counted JSON payload exchanged with stores.
pub type RawValue = Arc<Value>;

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_keys(keys: &[&str]) -> Result<()> {
    for key in keys {
        validate_key(key)?;
    }
    Ok(())
}

/// Object-safe cache contract.
///
/// All operations are safe for concurrent invocation and complete in bounded
/// work; cancellation is modeled by dropping the returned future. Keys must
/// be non-empty. Payload-level methods carry a `_raw` suffix; the typed
/// equivalents live on [`CacheClientExt`].
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// When true, serialization problems surface as
    /// [`CacheError::Serialization`] instead of degrading to misses and
    /// failed writes.
    fn strict_serialization(&self) -> bool {
        false
    }

    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>>;

    /// Resolve every requested key to its current cache value.
    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining time to live; `None` when the key is absent, expired, or
    /// has no expiration.
    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>>;

    /// Remaining TTLs for `keys`; absent and expired keys are omitted, keys
    /// without expiration map to `None`.
    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>>;

    /// Unconditional write. Returns false when the write was refused (zero
    /// TTL, oversize entry in lenient mode).
    async fn set_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Write only if the key is absent (or expired).
    async fn add_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Write only if the key is present.
    async fn replace_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Atomically replace the value only when it currently equals
    /// `expected`. A lost race reports false, never an error.
    async fn replace_if_equal_raw(
        &self,
        key: &str,
        value: Value,
        expected: Value,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Set every entry in `items`; returns the number written.
    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<usize>;

    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove only when the current value equals `expected`.
    async fn remove_if_equal_raw(&self, key: &str, expected: Value) -> Result<bool>;

    /// Remove the listed keys; `None` (or an empty list) flushes everything.
    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize>;

    /// Remove keys sharing a literal prefix; the empty prefix removes all.
    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize>;

    /// Atomic integer add; creates the key when absent. Returns the new
    /// value.
    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Atomic floating-point add; creates the key when absent.
    async fn increment_float(&self, key: &str, amount: f64, ttl: Option<Duration>) -> Result<f64>;

    /// Store `value` only if it is strictly greater than the current value.
    /// Returns the absolute difference, the value itself when the key was
    /// absent, or 0 when the condition failed.
    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64>;

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64>;

    /// Store `value` only if it is strictly lower than the current value.
    /// Same return convention as [`CacheClient::set_if_higher`].
    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64>;

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64>;

    /// Add elements to a list entry, each with its own expiration derived
    /// from `ttl`. Duplicate elements refresh their expiration. Returns the
    /// number of distinct elements processed.
    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize>;

    /// Remove elements from a list entry; returns the number of live
    /// elements removed.
    async fn list_remove_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize>;

    /// Read the live elements of a list entry. `page` is 1-based; `None`
    /// returns all live elements. An empty live list reads as `Missing`.
    async fn get_list_raw(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>>;

    /// Update a key's expiration; zero deletes. Missing keys are a no-op.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Per-key expiration updates: `None` clears the TTL, zero deletes,
    /// positive sets. Missing keys are ignored.
    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()>;
}

fn encode<T: Serialize>(strict: bool, value: &T) -> Result<Option<Value>> {
    match serde_json::to_value(value) {
        Ok(v) => Ok(Some(v)),
        Err(err) if strict => Err(err.into()),
        Err(err) => {
            error!(error = %err, "failed to serialize cache value, treating write as failed");
            Ok(None)
        }
    }
}

fn decode<T: DeserializeOwned>(strict: bool, raw: &Value) -> Result<CacheValue<T>> {
    match T::deserialize(raw) {
        Ok(v) => Ok(CacheValue::Value(v)),
        Err(err) if strict => Err(err.into()),
        Err(err) => {
            error!(error = %err, "failed to deserialize cache value, treating as miss");
            Ok(CacheValue::Missing)
        }
    }
}

/// Typed convenience surface over any [`CacheClient`].
///
/// Values are serialized to the store's payload representation on write and
/// deserialized on read. By default a payload that fails to round-trip is
/// treated as a miss (reads) or a failed write; stores configured with
/// `throw_on_serialization_error` surface the error instead.
#[async_trait]
pub trait CacheClientExt: CacheClient {
    async fn get<T>(&self, key: &str) -> Result<CacheValue<T>>
    where
        T: DeserializeOwned,
    {
        match self.get_raw(key).await? {
            CacheValue::Missing => Ok(CacheValue::Missing),
            CacheValue::Null => Ok(CacheValue::Null),
            CacheValue::Value(raw) => decode(self.strict_serialization(), &raw),
        }
    }

    async fn get_all<T>(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<T>>>
    where
        T: DeserializeOwned,
    {
        let raw = self.get_all_raw(keys).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let decoded = match value {
                CacheValue::Missing => CacheValue::Missing,
                CacheValue::Null => CacheValue::Null,
                CacheValue::Value(raw) => decode(self.strict_serialization(), &raw)?,
            };
            out.insert(key, decoded);
        }
        Ok(out)
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        match encode(self.strict_serialization(), value)? {
            Some(v) => self.set_raw(key, v, ttl).await,
            None => Ok(false),
        }
    }

    async fn add<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        match encode(self.strict_serialization(), value)? {
            Some(v) => self.add_raw(key, v, ttl).await,
            None => Ok(false),
        }
    }

    async fn replace<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        match encode(self.strict_serialization(), value)? {
            Some(v) => self.replace_raw(key, v, ttl).await,
            None => Ok(false),
        }
    }

    async fn replace_if_equal<T>(
        &self,
        key: &str,
        value: &T,
        expected: &T,
        ttl: Option<Duration>,
    ) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        let strict = self.strict_serialization();
        match (encode(strict, value)?, encode(strict, expected)?) {
            (Some(v), Some(e)) => self.replace_if_equal_raw(key, v, e, ttl).await,
            _ => Ok(false),
        }
    }

    async fn remove_if_equal<T>(&self, key: &str, expected: &T) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        match encode(self.strict_serialization(), expected)? {
            Some(e) => self.remove_if_equal_raw(key, e).await,
            None => Ok(false),
        }
    }

    async fn set_all<T>(&self, items: &HashMap<String, T>, ttl: Option<Duration>) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        let strict = self.strict_serialization();
        let mut encoded = HashMap::with_capacity(items.len());
        for (key, value) in items {
            if let Some(v) = encode(strict, value)? {
                encoded.insert(key.clone(), v);
            }
        }
        if encoded.is_empty() {
            return Ok(0);
        }
        self.set_all_raw(encoded, ttl).await
    }

    async fn list_add<T>(&self, key: &str, values: &[T], ttl: Option<Duration>) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        let strict = self.strict_serialization();
        let mut encoded = Vec::with_capacity(values.len());
        for value in values {
            if let Some(v) = encode(strict, value)? {
                encoded.push(v);
            }
        }
        self.list_add_raw(key, encoded, ttl).await
    }

    async fn list_remove<T>(&self, key: &str, values: &[T], ttl: Option<Duration>) -> Result<usize>
    where
        T: Serialize + Sync,
    {
        let strict = self.strict_serialization();
        let mut encoded = Vec::with_capacity(values.len());
        for value in values {
            if let Some(v) = encode(strict, value)? {
                encoded.push(v);
            }
        }
        self.list_remove_raw(key, encoded, ttl).await
    }

    async fn get_list<T>(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<T>>>
    where
        T: DeserializeOwned,
    {
        let strict = self.strict_serialization();
        match self.get_list_raw(key, page, page_size).await? {
            CacheValue::Missing => Ok(CacheValue::Missing),
            CacheValue::Null => Ok(CacheValue::Null),
            CacheValue::Value(raw_items) => {
                let mut items = Vec::with_capacity(raw_items.len());
                for raw in &raw_items {
                    // lenient mode drops undecodable elements
                    if let CacheValue::Value(v) = decode::<T>(strict, raw)? {
                        items.push(v);
                    }
                }
                Ok(CacheValue::Value(items))
            }
        }
    }
}

impl<C: CacheClient + ?Sized> CacheClientExt for C {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_lenient_swallows_and_strict_surfaces() {
        // serde_json cannot serialize maps with non-string keys
        let mut bad = HashMap::new();
        bad.insert(vec![1_u8], "x");

        assert!(encode(false, &bad).unwrap().is_none());
        assert!(matches!(
            encode(true, &bad),
            Err(CacheError::Serialization(_))
        ));

        assert_eq!(encode(false, &7_i64).unwrap(), Some(Value::from(7)));
    }

    #[test]
    fn decode_lenient_misses_and_strict_surfaces() {
        let raw = Value::from("not a number");
        let lenient = decode::<u64>(false, &raw).unwrap();
        assert!(lenient.is_missing());
        assert!(matches!(
            decode::<u64>(true, &raw),
            Err(CacheError::Serialization(_))
        ));
    }
}
