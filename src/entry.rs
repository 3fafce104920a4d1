use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;

use crate::RawValue;

// Global tiebreaker for eviction ordering; strictly increasing across all
// engine instances in the process.
static INSTANCE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_instance_number() -> u64 {
    INSTANCE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One element of a list entry with its own optional expiration.
pub(crate) struct ListElement {
    pub value: RawValue,
    pub expires_at: Option<Instant>,
}

impl ListElement {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Stored payload: either a single value or a set of elements keyed by their
/// canonical JSON encoding, preserving insertion order for paging.
pub(crate) enum Payload {
    Scalar(RawValue),
    List(IndexMap<String, ListElement>),
}

/// Internal record for one cached key.
pub(crate) struct CacheEntry {
    pub payload: Payload,
    pub expires_at: Option<Instant>,
    pub last_access: Instant,
    pub last_modified: Instant,
    pub instance_number: u64,
    /// Byte estimate; 0 when size tracking is disabled.
    pub size: usize,
}

impl CacheEntry {
    pub fn new(payload: Payload, expires_at: Option<Instant>, now: Instant, size: usize) -> Self {
        Self {
            payload,
            expires_at,
            last_access: now,
            last_modified: now,
            instance_number: next_instance_number(),
            size,
        }
    }

    /// An entry with a past expiration is semantically absent.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
    }

    pub fn ttl_remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.and_then(|at| at.checked_duration_since(now))
    }

    pub fn scalar(&self) -> Option<&RawValue> {
        match &self.payload {
            Payload::Scalar(v) => Some(v),
            Payload::List(_) => None,
        }
    }
}

/// Compute an absolute expiration from a TTL. `Duration::MAX`, or any span
/// that overflows `Instant` arithmetic, means "never expires".
pub(crate) fn expiry_for(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    match ttl {
        None => None,
        Some(d) if d == Duration::MAX => None,
        Some(d) => now.checked_add(d),
    }
}

/// The "ttl <= 0" column of the operation table: a zero span deletes.
pub(crate) fn is_delete_ttl(ttl: Option<Duration>) -> bool {
    ttl.is_some_and(|d| d.is_zero())
}

/// Entry-level expiration of a list: the max element expiration, or none if
/// any element never expires.
pub(crate) fn list_expiration(elements: &IndexMap<String, ListElement>) -> Option<Instant> {
    let mut max: Option<Instant> = None;
    for element in elements.values() {
        match element.expires_at {
            None => return None,
            Some(at) => max = Some(max.map_or(at, |m| m.max(at))),
        }
    }
    max
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scalar(v: Value) -> Payload {
        Payload::Scalar(Arc::new(v))
    }

    #[test]
    fn instance_numbers_strictly_increase() {
        let a = next_instance_number();
        let b = next_instance_number();
        assert!(b > a);
    }

    #[test]
    fn expiry_semantics() {
        let now = Instant::now();
        assert_eq!(expiry_for(now, None), None);
        assert_eq!(expiry_for(now, Some(Duration::MAX)), None);
        assert_eq!(
            expiry_for(now, Some(Duration::from_secs(5))),
            Some(now + Duration::from_secs(5))
        );

        assert!(is_delete_ttl(Some(Duration::ZERO)));
        assert!(!is_delete_ttl(None));
        assert!(!is_delete_ttl(Some(Duration::from_secs(1))));
    }

    #[test]
    fn expired_entry_is_absent() {
        let now = Instant::now();
        let entry = CacheEntry::new(scalar(Value::from(1)), Some(now), now, 0);
        assert!(entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_secs(1)));

        let live = CacheEntry::new(
            scalar(Value::from(1)),
            Some(now + Duration::from_secs(5)),
            now,
            0,
        );
        assert!(!live.is_expired(now));
        assert_eq!(
            live.ttl_remaining(now + Duration::from_secs(2)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn list_expiration_is_max_or_unbounded() {
        let now = Instant::now();
        let mut elements: IndexMap<String, ListElement> = IndexMap::new();
        elements.insert(
            "\"a\"".into(),
            ListElement {
                value: Arc::new(Value::from("a")),
                expires_at: Some(now + Duration::from_secs(1)),
            },
        );
        elements.insert(
            "\"b\"".into(),
            ListElement {
                value: Arc::new(Value::from("b")),
                expires_at: Some(now + Duration::from_secs(9)),
            },
        );
        assert_eq!(list_expiration(&elements), Some(now + Duration::from_secs(9)));

        elements.insert(
            "\"c\"".into(),
            ListElement {
                value: Arc::new(Value::from("c")),
                expires_at: None,
            },
        );
        assert_eq!(list_expiration(&elements), None);
    }
}
