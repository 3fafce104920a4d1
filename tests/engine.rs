/*!
Contract tests for the in-memory engine across the typed cache surface.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache::{
    CacheClient, CacheClientExt, CacheError, CacheValue, InMemoryCache, ManualClock, NullCache,
    ScopedCache,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    user_id: u64,
    token: String,
    roles: Vec<String>,
}

fn session() -> Session {
    Session {
        user_id: 42,
        token: "abc123".into(),
        roles: vec!["admin".into(), "ops".into()],
    }
}

fn engine_with_clock(clock: &ManualClock) -> InMemoryCache {
    InMemoryCache::builder()
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn unwritten_keys_never_have_values() {
    let cache = InMemoryCache::new();
    for key in ["a", "b", "some:longer:key"] {
        assert!(!cache.get::<String>(key).await.unwrap().has_value());
        assert!(!cache.exists(key).await.unwrap());
    }
}

#[tokio::test]
async fn complex_values_round_trip() {
    let cache = InMemoryCache::builder()
        .clone_on_access(true)
        .build()
        .unwrap();
    let value = session();

    assert!(cache.set("s", &value, Some(Duration::from_secs(60))).await.unwrap());
    let read = cache.get::<Session>("s").await.unwrap().into_value().unwrap();
    assert_eq!(read, value);
}

#[tokio::test]
async fn reads_after_expiry_miss_and_count() {
    let clock = ManualClock::new();
    let cache = engine_with_clock(&clock);

    cache.set("k", &1_u64, Some(Duration::from_secs(10))).await.unwrap();
    clock.advance(Duration::from_secs(11));

    let misses_before = cache.misses();
    assert!(!cache.get::<u64>("k").await.unwrap().has_value());
    assert_eq!(cache.misses(), misses_before + 1);
    assert!(!cache.exists("k").await.unwrap());
}

#[tokio::test]
async fn repeated_sets_without_ttl_stay_unexpiring() {
    let cache = InMemoryCache::new();
    for i in 0..5_u64 {
        cache.set("k", &i, None).await.unwrap();
        assert_eq!(cache.get_expiration("k").await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_increments_sum_exactly() {
    let cache = InMemoryCache::new();
    let mut handles = Vec::new();
    for worker in 0..16_i64 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..250 {
                cache.increment("total", worker % 3 + 1, None).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let expected: i64 = (0..16).map(|w| (w % 3 + 1) * 250).sum();
    assert_eq!(
        cache.get::<i64>("total").await.unwrap().into_value(),
        Some(expected)
    );
}

#[tokio::test]
async fn list_elements_disappear_after_their_ttl() {
    let clock = ManualClock::new();
    let cache = engine_with_clock(&clock);

    cache
        .list_add("l", &["short"], Some(Duration::from_secs(1)))
        .await
        .unwrap();
    cache
        .list_add("l", &["long"], Some(Duration::from_secs(30)))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(2));
    let items = cache
        .get_list::<String>("l", Some(1), 100)
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(items, vec!["long".to_string()]);
}

#[tokio::test]
async fn item_cap_bounds_the_store() {
    let cache = InMemoryCache::builder().max_items(8).build().unwrap();
    for i in 0..50 {
        cache.set(&format!("k{i}"), &i, None).await.unwrap();
    }
    assert!(cache.count() <= 8);
}

#[tokio::test]
async fn memory_cap_bounds_estimated_usage() {
    let cache = InMemoryCache::builder().max_memory(8192).build().unwrap();
    for i in 0..100 {
        cache.set(&format!("k{i}"), &"y".repeat(256), None).await.unwrap();
    }
    // one in-flight write of slack allowed
    assert!(cache.memory_size() <= 8192 + 512);
}

#[tokio::test]
async fn lru_scenario_evicts_coldest_key() {
    let clock = ManualClock::new();
    let cache = InMemoryCache::builder()
        .max_items(2)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    cache.set("a", &1_u64, None).await.unwrap();
    clock.advance(Duration::from_millis(5));
    cache.set("b", &2_u64, None).await.unwrap();
    clock.advance(Duration::from_millis(5));
    assert!(cache.get::<u64>("a").await.unwrap().has_value());
    clock.advance(Duration::from_millis(5));
    cache.set("c", &3_u64, None).await.unwrap();

    assert!(cache.exists("a").await.unwrap());
    assert!(!cache.exists("b").await.unwrap());
    assert!(cache.exists("c").await.unwrap());
}

#[tokio::test]
async fn remove_twice_reports_false() {
    let cache = InMemoryCache::new();
    cache.set("k", &1_u64, None).await.unwrap();
    assert!(cache.remove("k").await.unwrap());
    assert!(!cache.remove("k").await.unwrap());
}

#[tokio::test]
async fn failed_compare_and_swap_leaves_entry_untouched() {
    let cache = InMemoryCache::new();
    cache.set("k", &session(), Some(Duration::from_secs(60))).await.unwrap();

    let other = Session {
        user_id: 1,
        token: "zzz".into(),
        roles: vec![],
    };
    assert!(!cache
        .replace_if_equal("k", &other, &other, Some(Duration::from_secs(1)))
        .await
        .unwrap());

    assert_eq!(
        cache.get::<Session>("k").await.unwrap().into_value().unwrap(),
        session()
    );
    let remaining = cache.get_expiration("k").await.unwrap().unwrap();
    assert!(remaining > Duration::from_secs(50));
}

#[tokio::test]
async fn counter_scenario_keeps_expiration() {
    let clock = ManualClock::new();
    let cache = engine_with_clock(&clock);

    cache.set("counter", &0_i64, Some(Duration::from_secs(300))).await.unwrap();
    assert_eq!(cache.increment("counter", 1, None).await.unwrap(), 1);

    let remaining = cache.get_expiration("counter").await.unwrap().unwrap();
    assert!(remaining > Duration::ZERO && remaining <= Duration::from_secs(300));
    assert_eq!(cache.get::<i64>("counter").await.unwrap().into_value(), Some(1));
}

#[tokio::test]
async fn high_watermark_scenario() {
    let cache = InMemoryCache::new();
    cache.set("max", &100_i64, Some(Duration::from_secs(3600))).await.unwrap();

    assert_eq!(
        cache
            .set_if_higher("max", 50, Some(Duration::from_secs(7200)))
            .await
            .unwrap(),
        0
    );
    let remaining = cache.get_expiration("max").await.unwrap().unwrap();
    assert!(remaining <= Duration::from_secs(3600));

    assert_eq!(
        cache
            .set_if_higher("max", 200, Some(Duration::from_secs(7200)))
            .await
            .unwrap(),
        100
    );
    let remaining = cache.get_expiration("max").await.unwrap().unwrap();
    assert!(remaining > Duration::from_secs(3600));
}

#[tokio::test]
async fn non_positive_ttl_scenario() {
    let cache = InMemoryCache::new();
    assert!(!cache.set("k", &"v", Some(Duration::ZERO)).await.unwrap());
    assert!(!cache.exists("k").await.unwrap());
}

#[tokio::test]
async fn get_all_mixes_states() {
    let cache = InMemoryCache::new();
    cache.set("present", &1_u64, None).await.unwrap();
    cache.set_raw("null", serde_json::Value::Null, None).await.unwrap();

    let all = cache
        .get_all::<u64>(&["present", "null", "missing"])
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all["present"], CacheValue::Value(1));
    assert_eq!(all["null"], CacheValue::Null);
    assert_eq!(all["missing"], CacheValue::Missing);
}

#[tokio::test]
async fn invalid_arguments_fail_fast() {
    let cache = InMemoryCache::new();
    assert!(matches!(
        cache.get::<u64>("").await,
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        cache.get_list::<String>("l", Some(0), 10).await,
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        cache.get_list::<String>("l", None, 0).await,
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        cache.get_all::<u64>(&["ok", ""]).await,
        Err(CacheError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn trait_objects_compose() {
    // decorators and collaborators all speak the same contract
    let backend: Arc<dyn CacheClient> = Arc::new(InMemoryCache::new());
    let scoped: Arc<dyn CacheClient> = Arc::new(ScopedCache::new(backend.clone(), "jobs"));
    let null: Arc<dyn CacheClient> = Arc::new(NullCache::new());

    scoped.set("1", &session(), None).await.unwrap();
    assert!(scoped.get::<Session>("1").await.unwrap().has_value());
    assert!(backend.get::<Session>("jobs:1").await.unwrap().has_value());

    assert!(null.set("1", &session(), None).await.unwrap());
    assert!(null.get::<Session>("1").await.unwrap().is_missing());
}

#[tokio::test]
async fn expiration_notifications_reach_subscribers() {
    let clock = ManualClock::new();
    let cache = engine_with_clock(&clock);
    let mut expirations = cache.subscribe_expirations();

    cache.set("gone", &1_u64, Some(Duration::from_secs(1))).await.unwrap();
    clock.advance(Duration::from_secs(3));
    cache.run_maintenance();

    let event = expirations.try_recv().unwrap();
    assert_eq!(event.key, "gone");
    assert!(event.send_notification);
}

#[tokio::test]
async fn set_all_and_remove_by_prefix() {
    let cache = InMemoryCache::new();
    let mut items = HashMap::new();
    items.insert("tenant:a".to_string(), 1_u64);
    items.insert("tenant:b".to_string(), 2_u64);
    items.insert("other".to_string(), 3_u64);

    assert_eq!(cache.set_all(&items, Some(Duration::from_secs(60))).await.unwrap(), 3);
    assert_eq!(cache.remove_by_prefix("tenant:").await.unwrap(), 2);
    assert!(cache.exists("other").await.unwrap());
}
