use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::value::CacheValue;
use crate::{validate_key, validate_keys, CacheClient, RawValue};

/// No-op implementation of the cache contract.
///
/// Reads always miss, writes report success, counts are zero. Used wherever
/// a cache collaborator is optional; call counters make interactions
/// observable in tests.
#[derive(Debug, Default)]
pub struct NullCache {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl NullCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheClient for NullCache {
    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>> {
        validate_key(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(CacheValue::Missing)
    }

    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>> {
        validate_keys(keys)?;
        self.reads.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(keys
            .iter()
            .map(|k| ((*k).to_string(), CacheValue::Missing))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        validate_key(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>> {
        validate_keys(keys)?;
        self.reads.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(HashMap::new())
    }

    async fn set_raw(&self, key: &str, _value: Value, _ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn add_raw(&self, key: &str, _value: Value, _ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn replace_raw(&self, key: &str, _value: Value, _ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn replace_if_equal_raw(
        &self,
        key: &str,
        _value: Value,
        _expected: Value,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        _ttl: Option<Duration>,
    ) -> Result<usize> {
        for key in items.keys() {
            validate_key(key)?;
        }
        self.writes.fetch_add(items.len() as u64, Ordering::Relaxed);
        Ok(items.len())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    async fn remove_if_equal_raw(&self, key: &str, _expected: Value) -> Result<bool> {
        validate_key(key)?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize> {
        if let Some(keys) = keys {
            validate_keys(keys)?;
        }
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }

    async fn remove_by_prefix(&self, _prefix: &str) -> Result<usize> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }

    async fn increment(&self, key: &str, amount: i64, _ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(amount)
    }

    async fn increment_float(&self, key: &str, amount: f64, _ttl: Option<Duration>) -> Result<f64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(amount)
    }

    async fn set_if_higher(&self, key: &str, value: i64, _ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        _ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set_if_lower(&self, key: &str, value: i64, _ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        _ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        _ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(values.len())
    }

    async fn list_remove_raw(
        &self,
        key: &str,
        _values: Vec<Value>,
        _ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }

    async fn get_list_raw(
        &self,
        key: &str,
        _page: Option<usize>,
        _page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>> {
        validate_key(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(CacheValue::Missing)
    }

    async fn set_expiration(&self, key: &str, _ttl: Duration) -> Result<()> {
        validate_key(key)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()> {
        for key in expirations.keys() {
            validate_key(key)?;
        }
        self.writes
            .fetch_add(expirations.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheClientExt;

    #[tokio::test]
    async fn reads_miss_and_writes_succeed() {
        let cache = NullCache::new();

        assert!(cache.get::<u64>("k").await.unwrap().is_missing());
        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.set("k", &1, None).await.unwrap());
        // still missing after a write
        assert!(cache.get::<u64>("k").await.unwrap().is_missing());

        assert_eq!(cache.increment("n", 5, None).await.unwrap(), 5);
        assert_eq!(cache.remove_all(None).await.unwrap(), 0);
        assert!(!cache.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn counters_track_calls() {
        let cache = NullCache::new();
        let _ = cache.get::<u64>("a").await.unwrap();
        let _ = cache.exists("b").await.unwrap();
        let _ = cache.set("c", &1, None).await.unwrap();
        let _ = cache.remove("c").await.unwrap();

        assert_eq!(cache.reads(), 2);
        assert_eq!(cache.writes(), 1);
        assert_eq!(cache.removes(), 1);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let cache = NullCache::new();
        assert!(cache.get::<u64>("").await.is_err());
        assert!(cache.set("", &1, None).await.is_err());
    }
}
