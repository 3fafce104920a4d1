use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::value::CacheValue;
use crate::{validate_key, CacheClient, RawValue};

/// Decorator that prefixes every key with `"{scope}:"`, letting several
/// logical caches share one backend.
///
/// The scope is set at most once, either at construction or later through
/// [`ScopedCache::set_scope`]; reassignment fails with `InvalidState`.
/// Results that carry keys are un-prefixed before they are returned.
pub struct ScopedCache {
    inner: Arc<dyn CacheClient>,
    scope: OnceLock<String>,
}

impl ScopedCache {
    #[must_use]
    pub fn new(inner: Arc<dyn CacheClient>, scope: impl Into<String>) -> Self {
        let cache = Self::unscoped(inner);
        let _ = cache.scope.set(scope.into());
        cache
    }

    /// A pass-through decorator whose scope can be bound later.
    #[must_use]
    pub fn unscoped(inner: Arc<dyn CacheClient>) -> Self {
        Self {
            inner,
            scope: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.get().map(String::as_str)
    }

    /// Bind the scope. Fails with `InvalidState` once a scope is set.
    pub fn set_scope(&self, scope: impl Into<String>) -> Result<()> {
        self.scope
            .set(scope.into())
            .map_err(|_| CacheError::invalid_state("scope has already been set"))
    }

    fn prefix(&self) -> Option<String> {
        self.scope.get().map(|s| format!("{s}:"))
    }

    fn scoped_key(&self, key: &str) -> String {
        match self.scope.get() {
            Some(scope) => format!("{scope}:{key}"),
            None => key.to_string(),
        }
    }

    fn scoped_keys(&self, keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| self.scoped_key(k)).collect()
    }

    fn unscope(&self, key: &str) -> String {
        match self.prefix() {
            Some(prefix) => key.strip_prefix(&prefix).unwrap_or(key).to_string(),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl CacheClient for ScopedCache {
    fn strict_serialization(&self) -> bool {
        self.inner.strict_serialization()
    }

    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>> {
        validate_key(key)?;
        self.inner.get_raw(&self.scoped_key(key)).await
    }

    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>> {
        let scoped = self.scoped_keys(keys);
        let refs: Vec<&str> = scoped.iter().map(String::as_str).collect();
        let out = self.inner.get_all_raw(&refs).await?;
        Ok(out
            .into_iter()
            .map(|(k, v)| (self.unscope(&k), v))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.exists(&self.scoped_key(key)).await
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        validate_key(key)?;
        self.inner.get_expiration(&self.scoped_key(key)).await
    }

    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>> {
        let scoped = self.scoped_keys(keys);
        let refs: Vec<&str> = scoped.iter().map(String::as_str).collect();
        let out = self.inner.get_all_expirations(&refs).await?;
        Ok(out
            .into_iter()
            .map(|(k, v)| (self.unscope(&k), v))
            .collect())
    }

    async fn set_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner.set_raw(&self.scoped_key(key), value, ttl).await
    }

    async fn add_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner.add_raw(&self.scoped_key(key), value, ttl).await
    }

    async fn replace_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner
            .replace_raw(&self.scoped_key(key), value, ttl)
            .await
    }

    async fn replace_if_equal_raw(
        &self,
        key: &str,
        value: Value,
        expected: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        self.inner
            .replace_if_equal_raw(&self.scoped_key(key), value, expected, ttl)
            .await
    }

    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let scoped = items
            .into_iter()
            .map(|(k, v)| (self.scoped_key(&k), v))
            .collect();
        self.inner.set_all_raw(scoped, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.remove(&self.scoped_key(key)).await
    }

    async fn remove_if_equal_raw(&self, key: &str, expected: Value) -> Result<bool> {
        validate_key(key)?;
        self.inner
            .remove_if_equal_raw(&self.scoped_key(key), expected)
            .await
    }

    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize> {
        match keys {
            // flushing a scope only clears its own key space
            None | Some([]) => match self.prefix() {
                Some(prefix) => self.inner.remove_by_prefix(&prefix).await,
                None => self.inner.remove_all(None).await,
            },
            Some(keys) => {
                let scoped = self.scoped_keys(keys);
                let refs: Vec<&str> = scoped.iter().map(String::as_str).collect();
                self.inner.remove_all(Some(&refs)).await
            }
        }
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize> {
        // concatenating prefixes keeps nested scopes working
        self.inner
            .remove_by_prefix(&self.scoped_key(prefix))
            .await
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner
            .increment(&self.scoped_key(key), amount, ttl)
            .await
    }

    async fn increment_float(&self, key: &str, amount: f64, ttl: Option<Duration>) -> Result<f64> {
        validate_key(key)?;
        self.inner
            .increment_float(&self.scoped_key(key), amount, ttl)
            .await
    }

    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner
            .set_if_higher(&self.scoped_key(key), value, ttl)
            .await
    }

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.inner
            .set_if_higher_float(&self.scoped_key(key), value, ttl)
            .await
    }

    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner
            .set_if_lower(&self.scoped_key(key), value, ttl)
            .await
    }

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.inner
            .set_if_lower_float(&self.scoped_key(key), value, ttl)
            .await
    }

    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.inner
            .list_add_raw(&self.scoped_key(key), values, ttl)
            .await
    }

    async fn list_remove_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.inner
            .list_remove_raw(&self.scoped_key(key), values, ttl)
            .await
    }

    async fn get_list_raw(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>> {
        validate_key(key)?;
        self.inner
            .get_list_raw(&self.scoped_key(key), page, page_size)
            .await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        validate_key(key)?;
        self.inner.set_expiration(&self.scoped_key(key), ttl).await
    }

    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()> {
        let scoped = expirations
            .into_iter()
            .map(|(k, v)| (self.scoped_key(&k), v))
            .collect();
        self.inner.set_all_expirations(scoped).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryCache;
    use crate::CacheClientExt;

    fn scoped(scope: &str) -> (Arc<InMemoryCache>, ScopedCache) {
        let backend = Arc::new(InMemoryCache::new());
        let scoped = ScopedCache::new(backend.clone(), scope);
        (backend, scoped)
    }

    #[tokio::test]
    async fn keys_are_prefixed_on_the_backend() {
        let (backend, cache) = scoped("tenant1");
        cache.set("k", &1_u64, None).await.unwrap();

        assert_eq!(
            backend.get::<u64>("tenant1:k").await.unwrap().into_value(),
            Some(1)
        );
        assert_eq!(cache.get::<u64>("k").await.unwrap().into_value(), Some(1));
        assert!(backend.get::<u64>("k").await.unwrap().is_missing());
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let backend = Arc::new(InMemoryCache::new());
        let a = ScopedCache::new(backend.clone(), "a");
        let b = ScopedCache::new(backend.clone(), "b");

        a.set("k", &1_u64, None).await.unwrap();
        b.set("k", &2_u64, None).await.unwrap();

        assert_eq!(a.get::<u64>("k").await.unwrap().into_value(), Some(1));
        assert_eq!(b.get::<u64>("k").await.unwrap().into_value(), Some(2));

        // flushing a only clears a's key space
        a.remove_all(None).await.unwrap();
        assert!(a.get::<u64>("k").await.unwrap().is_missing());
        assert_eq!(b.get::<u64>("k").await.unwrap().into_value(), Some(2));
    }

    #[tokio::test]
    async fn results_are_unprefixed() {
        let (_, cache) = scoped("s");
        cache.set("a", &1_u64, None).await.unwrap();

        let all = cache.get_all::<u64>(&["a", "b"]).await.unwrap();
        assert_eq!(all["a"].value(), Some(&1));
        assert!(all["b"].is_missing());
        assert!(!all.contains_key("s:a"));
    }

    #[tokio::test]
    async fn scope_is_set_exactly_once() {
        let backend = Arc::new(InMemoryCache::new());
        let cache = ScopedCache::unscoped(backend.clone());
        assert!(cache.scope().is_none());

        cache.set_scope("late").unwrap();
        assert_eq!(cache.scope(), Some("late"));
        assert!(matches!(
            cache.set_scope("again"),
            Err(CacheError::InvalidState(_))
        ));

        let eager = ScopedCache::new(backend, "eager");
        assert!(matches!(
            eager.set_scope("other"),
            Err(CacheError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn nested_scopes_concatenate() {
        let backend = Arc::new(InMemoryCache::new());
        let outer = Arc::new(ScopedCache::new(backend.clone(), "outer"));
        let inner = ScopedCache::new(outer, "inner");

        inner.set("k", &1_u64, None).await.unwrap();
        assert_eq!(
            backend
                .get::<u64>("outer:inner:k")
                .await
                .unwrap()
                .into_value(),
            Some(1)
        );

        assert_eq!(inner.remove_by_prefix("").await.unwrap(), 1);
        assert!(inner.get::<u64>("k").await.unwrap().is_missing());
    }

    #[tokio::test]
    async fn numeric_and_list_operations_delegate() {
        let (backend, cache) = scoped("s");
        assert_eq!(cache.increment("n", 5, None).await.unwrap(), 5);
        assert_eq!(
            backend.get::<i64>("s:n").await.unwrap().into_value(),
            Some(5)
        );

        cache.list_add("l", &["a", "b"], None).await.unwrap();
        let items = cache
            .get_list::<String>("l", None, 100)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(items.len(), 2);
    }
}
