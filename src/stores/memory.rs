use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::entry::{
    expiry_for, is_delete_ttl, json_type_name, list_expiration, next_instance_number, CacheEntry,
    ListElement, Payload,
};
use crate::error::{CacheError, Result};
use crate::size::{measure, measure_list, SizeCalculator, SizeFn};
use crate::value::CacheValue;
use crate::{validate_key, validate_keys, CacheClient, RawValue};

// Compaction evicts at most this many entries per invocation so concurrent
// writers cannot keep it spinning.
const MAX_COMPACTION_REMOVALS: usize = 10;

// Maintenance runs no more often than this.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

// The sweep leaves very recently touched entries for the next pass.
const SWEEP_IDLE_THRESHOLD: Duration = Duration::from_millis(300);

const EXPIRED_CHANNEL_CAPACITY: usize = 256;

/// Notification that an entry became semantically absent through expiration.
///
/// Fired on expiry transitions only, never for overt removes or eviction of
/// live entries. `send_notification` is false when the expiration was driven
/// by a remote invalidation, telling hybrid subscribers not to re-broadcast.
#[derive(Debug, Clone)]
pub struct ExpiredEntry {
    pub key: String,
    pub send_notification: bool,
}

#[derive(Clone)]
struct Config {
    max_items: Option<usize>,
    max_memory: Option<usize>,
    max_entry_size: Option<usize>,
    clone_on_access: bool,
    throw_on_serialization_error: bool,
    throw_on_max_entry_size_exceeded: bool,
    size_tracking: bool,
}

/// Configures and validates an [`InMemoryCache`].
pub struct InMemoryCacheBuilder {
    max_items: Option<usize>,
    max_memory: Option<usize>,
    max_entry_size: Option<usize>,
    clone_on_access: bool,
    throw_on_serialization_error: bool,
    throw_on_max_entry_size_exceeded: bool,
    size_calculator: Option<Arc<SizeFn>>,
    clock: Option<Arc<dyn Clock>>,
}

impl InMemoryCacheBuilder {
    fn new() -> Self {
        Self {
            max_items: None,
            max_memory: None,
            max_entry_size: None,
            clone_on_access: false,
            throw_on_serialization_error: false,
            throw_on_max_entry_size_exceeded: false,
            size_calculator: None,
            clock: None,
        }
    }

    /// Cap the number of entries; overflow triggers LRU compaction.
    #[must_use]
    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }

    /// Cap estimated memory in bytes; overflow triggers size-aware
    /// compaction. Enables size tracking.
    #[must_use]
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Refuse single entries larger than `bytes`. Enables size tracking.
    #[must_use]
    pub fn max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = Some(bytes);
        self
    }

    /// Deep-copy non-primitive payloads on read instead of sharing them.
    #[must_use]
    pub fn clone_on_access(mut self, clone: bool) -> Self {
        self.clone_on_access = clone;
        self
    }

    /// Surface serialization failures instead of degrading to misses.
    #[must_use]
    pub fn throw_on_serialization_error(mut self, throw: bool) -> Self {
        self.throw_on_serialization_error = throw;
        self
    }

    /// Raise [`CacheError::MaxEntrySizeExceeded`] for oversize writes
    /// instead of silently failing them.
    #[must_use]
    pub fn throw_on_max_entry_size_exceeded(mut self, throw: bool) -> Self {
        self.throw_on_max_entry_size_exceeded = throw;
        self
    }

    /// Override the byte estimator. Enables size tracking.
    #[must_use]
    pub fn size_calculator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> usize + Send + Sync + 'static,
    {
        self.size_calculator = Some(Arc::new(f));
        self
    }

    /// Substitute the time source, mainly for tests.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<InMemoryCache> {
        if self.max_items == Some(0) {
            return Err(CacheError::invalid_argument("max_items must be positive"));
        }
        if self.max_memory == Some(0) {
            return Err(CacheError::invalid_argument("max_memory must be positive"));
        }
        if self.max_entry_size == Some(0) {
            return Err(CacheError::invalid_argument(
                "max_entry_size must be positive",
            ));
        }
        if let (Some(entry), Some(memory)) = (self.max_entry_size, self.max_memory) {
            if entry > memory {
                return Err(CacheError::invalid_argument(
                    "max_entry_size must not exceed max_memory",
                ));
            }
        }

        let size_tracking = self.max_memory.is_some()
            || self.max_entry_size.is_some()
            || self.size_calculator.is_some();
        let config = Config {
            max_items: self.max_items,
            max_memory: self.max_memory,
            max_entry_size: self.max_entry_size,
            clone_on_access: self.clone_on_access,
            throw_on_serialization_error: self.throw_on_serialization_error,
            throw_on_max_entry_size_exceeded: self.throw_on_max_entry_size_exceeded,
            size_tracking,
        };
        Ok(InMemoryCache {
            inner: Arc::new(Inner::new(
                config,
                self.size_calculator,
                self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            )),
        })
    }
}

struct Inner {
    entries: DashMap<String, CacheEntry>,
    config: Config,
    custom_size: Option<Arc<SizeFn>>,
    size_calculator: SizeCalculator,
    clock: Arc<dyn Clock>,
    memory: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expired_tx: broadcast::Sender<ExpiredEntry>,
    compaction_lock: Mutex<()>,
    maintenance_scheduled: AtomicBool,
    disposed: AtomicBool,
}

impl Inner {
    fn new(config: Config, custom_size: Option<Arc<SizeFn>>, clock: Arc<dyn Clock>) -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRED_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            config,
            custom_size,
            size_calculator: SizeCalculator::new(),
            clock,
            memory: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            expired_tx,
            compaction_lock: Mutex::new(()),
            maintenance_scheduled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::invalid_state("cache has been disposed"));
        }
        Ok(())
    }

    fn measure_value(&self, value: &Value) -> usize {
        if !self.config.size_tracking {
            return 0;
        }
        measure(self.custom_size.as_ref(), &self.size_calculator, value)
    }

    fn measure_elements(&self, elements: &IndexMap<String, ListElement>) -> usize {
        if !self.config.size_tracking {
            return 0;
        }
        measure_list(
            self.custom_size.as_ref(),
            &self.size_calculator,
            elements.values().map(|el| el.value.as_ref()),
        )
    }

    /// Enforce `max_entry_size`. Ok(false) means the write must silently
    /// fail; Err carries the strict-mode error.
    fn entry_size_ok(&self, size: usize, type_name: &'static str) -> Result<bool> {
        let Some(max_size) = self.config.max_entry_size else {
            return Ok(true);
        };
        if size <= max_size {
            return Ok(true);
        }
        if self.config.throw_on_max_entry_size_exceeded {
            return Err(CacheError::MaxEntrySizeExceeded {
                size,
                max_size,
                type_name,
            });
        }
        debug!(size, max_size, type_name, "write refused, entry exceeds max entry size");
        Ok(false)
    }

    fn add_memory(&self, delta: usize) {
        if delta == 0 {
            return;
        }
        let prev = self.memory.fetch_add(delta as u64, Ordering::AcqRel);
        if prev.checked_add(delta as u64).is_none() {
            warn!("memory counter saturated at maximum, size accounting degraded");
            self.memory.store(u64::MAX, Ordering::Release);
        }
    }

    fn sub_memory(&self, delta: usize) {
        if delta == 0 {
            return;
        }
        let mut current = self.memory.load(Ordering::Acquire);
        let mut clamped = false;
        loop {
            if current < delta as u64 {
                clamped = true;
            }
            let next = current.saturating_sub(delta as u64);
            match self
                .memory
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if clamped {
            warn!("memory counter clamped at zero, will be reconciled by maintenance");
        }
    }

    fn apply_size_delta(&self, old: usize, new: usize) {
        if new >= old {
            self.add_memory(new - old);
        } else {
            self.sub_memory(old - new);
        }
    }

    fn mark_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn emit_expired(&self, key: &str, send_notification: bool) {
        let _ = self.expired_tx.send(ExpiredEntry {
            key: key.to_string(),
            send_notification,
        });
    }

    fn over_item_limit(&self) -> bool {
        self.config
            .max_items
            .is_some_and(|max| self.entries.len() > max)
    }

    fn over_memory_limit(&self) -> bool {
        self.config
            .max_memory
            .is_some_and(|max| self.memory.load(Ordering::Acquire) > max as u64)
    }

    /// Remove a physically present key; memory accounting follows.
    fn take_entry(&self, key: &str) -> Option<CacheEntry> {
        let (_, entry) = self.entries.remove(key)?;
        self.sub_memory(entry.size);
        Some(entry)
    }

    /// Read-path removal of an entry observed expired. Guards against a
    /// concurrent rewrite with the instance number.
    fn reap_expired(&self, key: &str, instance_number: u64) {
        let removed = self
            .entries
            .remove_if(key, |_, e| e.instance_number == instance_number);
        if let Some((key, entry)) = removed {
            self.sub_memory(entry.size);
            self.emit_expired(&key, true);
        }
    }

    fn waste_score(&self, entry: &CacheEntry, now: Instant) -> f64 {
        let size_kb = (entry.size as f64 / 1024.0).max(1.0);
        let age_minutes = now
            .saturating_duration_since(entry.last_modified)
            .as_secs_f64()
            / 60.0;
        let idle_minutes = now
            .saturating_duration_since(entry.last_access)
            .as_secs_f64()
            / 60.0;
        size_kb.log10() + 0.5 * age_minutes.max(1.0).log10() + 2.0 * idle_minutes.max(1.0).log10()
    }

    /// Least recently used victim, ties broken by instance number; expired
    /// entries always win.
    fn select_lru_victim(&self, now: Instant) -> Option<(String, u64)> {
        let mut best: Option<(String, u64, Instant, u64)> = None;
        for item in self.entries.iter() {
            let entry = item.value();
            if entry.is_expired(now) {
                return Some((item.key().clone(), entry.instance_number));
            }
            let candidate = (entry.last_access, entry.instance_number);
            let better = match &best {
                None => true,
                Some((_, _, access, instance)) => candidate < (*access, *instance),
            };
            if better {
                best = Some((
                    item.key().clone(),
                    entry.instance_number,
                    entry.last_access,
                    entry.instance_number,
                ));
            }
        }
        best.map(|(key, instance, _, _)| (key, instance))
    }

    /// Highest waste score wins; expired entries short-circuit.
    fn select_waste_victim(&self, now: Instant) -> Option<(String, u64)> {
        let mut best: Option<(String, u64, f64)> = None;
        for item in self.entries.iter() {
            let entry = item.value();
            if entry.is_expired(now) {
                return Some((item.key().clone(), entry.instance_number));
            }
            let score = self.waste_score(entry, now);
            let better = match &best {
                None => true,
                Some((_, _, current)) => score > *current,
            };
            if better {
                best = Some((item.key().clone(), entry.instance_number, score));
            }
        }
        best.map(|(key, instance, _)| (key, instance))
    }

    /// Evict entries one at a time under the coarse lock, re-checking the
    /// overflow condition after each removal.
    fn compact(&self, now: Instant) {
        let _guard = self.compaction_lock.lock();
        let mut attempts = 0;
        while attempts < MAX_COMPACTION_REMOVALS {
            let over_items = self.over_item_limit();
            let over_memory = self.over_memory_limit();
            if !over_items && !over_memory {
                break;
            }
            attempts += 1;

            let victim = if over_items {
                self.select_lru_victim(now)
            } else {
                self.select_waste_victim(now)
            };
            let Some((key, instance_number)) = victim else {
                break;
            };
            // skip if the slot was rewritten since selection
            let removed = self
                .entries
                .remove_if(&key, |_, e| e.instance_number == instance_number);
            if let Some((key, entry)) = removed {
                self.sub_memory(entry.size);
                if entry.is_expired(now) {
                    self.emit_expired(&key, true);
                }
                debug!(key = %key, "evicted cache entry");
            }
        }
    }

    fn run_maintenance(&self) {
        let now = self.now();

        // 1. sweep expired entries that have not been touched very recently
        let mut expired_keys = Vec::new();
        for item in self.entries.iter() {
            let entry = item.value();
            if entry.is_expired(now)
                && now.saturating_duration_since(entry.last_access) >= SWEEP_IDLE_THRESHOLD
            {
                expired_keys.push(item.key().clone());
            }
        }
        for key in expired_keys {
            if let Some((key, entry)) = self.entries.remove_if(&key, |_, e| e.is_expired(now)) {
                self.sub_memory(entry.size);
                self.emit_expired(&key, true);
            }
        }

        // prune dead list elements so entries do not accumulate them
        for mut item in self.entries.iter_mut() {
            let entry = item.value_mut();
            if let Payload::List(elements) = &mut entry.payload {
                let before = elements.len();
                elements.retain(|_, el| !el.is_expired(now));
                if elements.len() != before {
                    entry.expires_at = list_expiration(elements);
                    entry.size = self.measure_elements(elements);
                }
            }
        }

        // 2. compact if still over capacity
        if self.over_item_limit() || self.over_memory_limit() {
            self.compact(now);
        }

        // 3. reconcile memory drift from a snapshot of the live set
        if self.config.size_tracking {
            let total: u64 = self
                .entries
                .iter()
                .filter(|item| !item.value().is_expired(now))
                .map(|item| item.value().size as u64)
                .sum();
            self.memory.store(total, Ordering::Release);
        }
    }

    fn has_pending_expirations(&self) -> bool {
        self.entries
            .iter()
            .any(|item| item.value().expires_at.is_some())
    }
}

/// Throttled fire-and-forget maintenance; callers never block on it.
fn schedule_maintenance(inner: &Arc<Inner>) {
    if inner.disposed.load(Ordering::Acquire) {
        return;
    }
    if inner.maintenance_scheduled.swap(true, Ordering::AcqRel) {
        return;
    }
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(MAINTENANCE_INTERVAL).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.maintenance_scheduled.store(false, Ordering::Release);
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }
        inner.run_maintenance();
        // keep sweeping while anything can still expire
        if inner.has_pending_expirations() {
            schedule_maintenance(&inner);
        }
    });
}

enum WriteMode {
    Set,
    Add,
    Replace,
}

enum Lookup {
    Missing,
    Value(CacheValue<RawValue>),
}

/// Concurrent in-process cache engine.
///
/// Cheap to clone; clones share the same store. Per-key updates are atomic
/// through the concurrent map's entry API, counters are atomic, and
/// compaction serializes behind a coarse lock. See the crate docs for the
/// contract and [`InMemoryCacheBuilder`] for the recognized options.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: Arc<Inner>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    /// Unbounded engine with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(
                Config {
                    max_items: None,
                    max_memory: None,
                    max_entry_size: None,
                    clone_on_access: false,
                    throw_on_serialization_error: false,
                    throw_on_max_entry_size_exceeded: false,
                    size_tracking: false,
                },
                None,
                Arc::new(SystemClock),
            )),
        }
    }

    #[must_use]
    pub fn builder() -> InMemoryCacheBuilder {
        InMemoryCacheBuilder::new()
    }

    /// Number of physically present entries, expired ones included until
    /// the next sweep.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Current estimated memory held by live entries, in bytes.
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        self.inner.memory.load(Ordering::Acquire)
    }

    pub fn reset_metrics(&self) {
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.writes.store(0, Ordering::Relaxed);
    }

    /// Subscribe to expiry transitions.
    #[must_use]
    pub fn subscribe_expirations(&self) -> broadcast::Receiver<ExpiredEntry> {
        self.inner.expired_tx.subscribe()
    }

    /// Clear the store, halt maintenance, and release the size-calculator
    /// cache. Subsequent operations fail with `InvalidState`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.entries.clear();
        self.inner.memory.store(0, Ordering::Release);
        self.inner.size_calculator.clear();
    }

    /// Run one maintenance pass inline. Exposed for deterministic tests;
    /// background scheduling normally takes care of this.
    pub fn run_maintenance(&self) {
        self.inner.run_maintenance();
    }

    /// Drop a key as if it had expired, emitting the expiration event with
    /// the given notification flag. Used by the hybrid tier to apply remote
    /// expirations without echoing them back.
    pub(crate) fn remove_as_expired(&self, key: &str, send_notification: bool) -> bool {
        match self.inner.take_entry(key) {
            Some(_) => {
                self.inner.emit_expired(key, send_notification);
                true
            }
            None => false,
        }
    }

    fn finish_write(&self) {
        if self.inner.over_item_limit() || self.inner.over_memory_limit() {
            self.inner.compact(self.inner.now());
        }
        schedule_maintenance(&self.inner);
    }

    fn materialize(&self, entry: &CacheEntry, now: Instant) -> CacheValue<RawValue> {
        match &entry.payload {
            Payload::Scalar(v) => {
                if v.is_null() {
                    CacheValue::Null
                } else if self.inner.config.clone_on_access && !is_primitive(v) {
                    CacheValue::Value(Arc::new(v.as_ref().clone()))
                } else {
                    CacheValue::Value(Arc::clone(v))
                }
            }
            Payload::List(elements) => {
                let live: Vec<Value> = elements
                    .values()
                    .filter(|el| !el.is_expired(now))
                    .map(|el| el.value.as_ref().clone())
                    .collect();
                CacheValue::Value(Arc::new(Value::Array(live)))
            }
        }
    }

    /// Shared read path: touches the entry on a hit, reaps it on observed
    /// expiry.
    fn lookup(&self, key: &str) -> Lookup {
        let now = self.inner.now();
        let mut reap: Option<u64> = None;
        let outcome = match self.inner.entries.get_mut(key) {
            None => Lookup::Missing,
            Some(mut entry) => {
                if entry.is_expired(now) {
                    reap = Some(entry.instance_number);
                    Lookup::Missing
                } else {
                    entry.touch(now);
                    let value = self.materialize(&entry, now);
                    Lookup::Value(value)
                }
            }
        };
        if let Some(instance_number) = reap {
            self.inner.reap_expired(key, instance_number);
        }
        outcome
    }

    fn put_scalar(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        mode: WriteMode,
    ) -> Result<bool> {
        if is_delete_ttl(ttl) {
            self.inner.take_entry(key);
            return Ok(false);
        }

        let size = self.inner.measure_value(&value);
        if !self.inner.entry_size_ok(size, json_type_name(&value))? {
            return Ok(false);
        }

        let now = self.inner.now();
        let expires_at = expiry_for(now, ttl);
        let mut reaped: Option<(String, usize)> = None;

        let written = match self.inner.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let expired = occupied.get().is_expired(now);
                match mode {
                    WriteMode::Add if !expired => false,
                    WriteMode::Replace if expired => {
                        let (key, entry) = occupied.remove_entry();
                        reaped = Some((key, entry.size));
                        false
                    }
                    _ => {
                        let old_size = occupied.get().size;
                        let entry = occupied.get_mut();
                        entry.payload = Payload::Scalar(Arc::new(value));
                        entry.expires_at = expires_at;
                        entry.last_access = now;
                        entry.last_modified = now;
                        entry.instance_number = next_instance_number();
                        entry.size = size;
                        self.inner.apply_size_delta(old_size, size);
                        true
                    }
                }
            }
            MapEntry::Vacant(vacant) => match mode {
                WriteMode::Replace => false,
                _ => {
                    vacant.insert(CacheEntry::new(
                        Payload::Scalar(Arc::new(value)),
                        expires_at,
                        now,
                        size,
                    ));
                    self.inner.add_memory(size);
                    true
                }
            },
        };

        if let Some((key, size)) = reaped {
            self.inner.sub_memory(size);
            self.inner.emit_expired(&key, true);
        }
        if written {
            self.inner.mark_write();
            self.finish_write();
        }
        Ok(written)
    }

    fn increment_number(
        &self,
        key: &str,
        amount: NumericAmount,
        ttl: Option<Duration>,
    ) -> Result<NumericAmount> {
        if is_delete_ttl(ttl) {
            self.inner.take_entry(key);
            self.inner.mark_write();
            return Ok(amount.zero());
        }

        let now = self.inner.now();
        let result = match self.inner.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    let size = self.inner.measure_value(&amount.to_value());
                    let old_size = entry.size;
                    *entry = CacheEntry::new(
                        Payload::Scalar(Arc::new(amount.to_value())),
                        expiry_for(now, ttl),
                        now,
                        size,
                    );
                    self.inner.apply_size_delta(old_size, size);
                    amount
                } else {
                    let current = entry.scalar().and_then(|v| amount.parse(v));
                    let next = match current {
                        Some(current) => amount.add(current),
                        None => {
                            error!(
                                key = %key,
                                "existing value is not numeric, resetting to increment amount"
                            );
                            amount
                        }
                    };
                    let value = next.to_value();
                    let size = self.inner.measure_value(&value);
                    let old_size = entry.size;
                    entry.payload = Payload::Scalar(Arc::new(value));
                    entry.last_access = now;
                    entry.last_modified = now;
                    entry.size = size;
                    // an explicit ttl updates expiration, absent preserves it
                    if ttl.is_some() {
                        entry.expires_at = expiry_for(now, ttl);
                    }
                    self.inner.apply_size_delta(old_size, size);
                    next
                }
            }
            MapEntry::Vacant(vacant) => {
                let value = amount.to_value();
                let size = self.inner.measure_value(&value);
                vacant.insert(CacheEntry::new(
                    Payload::Scalar(Arc::new(value)),
                    expiry_for(now, ttl),
                    now,
                    size,
                ));
                self.inner.add_memory(size);
                amount
            }
        };

        self.inner.mark_write();
        self.finish_write();
        Ok(result)
    }

    fn set_if_bound(
        &self,
        key: &str,
        value: NumericAmount,
        ttl: Option<Duration>,
        higher: bool,
    ) -> Result<NumericAmount> {
        if is_delete_ttl(ttl) {
            self.inner.take_entry(key);
            self.inner.mark_write();
            return Ok(value.zero());
        }

        let now = self.inner.now();
        let mut changed = false;
        let result = match self.inner.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = if entry.is_expired(now) {
                    None
                } else {
                    entry.scalar().and_then(|v| value.parse(v))
                };
                match current {
                    Some(current) => {
                        let wins = if higher {
                            value.gt(current)
                        } else {
                            value.lt(current)
                        };
                        if !wins {
                            return Ok(value.zero());
                        }
                        let payload = value.to_value();
                        let size = self.inner.measure_value(&payload);
                        let old_size = entry.size;
                        entry.payload = Payload::Scalar(Arc::new(payload));
                        entry.last_access = now;
                        entry.last_modified = now;
                        entry.size = size;
                        // condition met: absent ttl removes the expiration
                        entry.expires_at = expiry_for(now, ttl);
                        self.inner.apply_size_delta(old_size, size);
                        changed = true;
                        value.diff(current)
                    }
                    None => {
                        // expired or unparseable, treat the key as absent
                        let payload = value.to_value();
                        let size = self.inner.measure_value(&payload);
                        let old_size = entry.size;
                        *entry = CacheEntry::new(
                            Payload::Scalar(Arc::new(payload)),
                            expiry_for(now, ttl),
                            now,
                            size,
                        );
                        self.inner.apply_size_delta(old_size, size);
                        changed = true;
                        value
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                let payload = value.to_value();
                let size = self.inner.measure_value(&payload);
                vacant.insert(CacheEntry::new(
                    Payload::Scalar(Arc::new(payload)),
                    expiry_for(now, ttl),
                    now,
                    size,
                ));
                self.inner.add_memory(size);
                changed = true;
                value
            }
        };

        if changed {
            self.inner.mark_write();
            self.finish_write();
        }
        Ok(result)
    }

    fn canonical_keys(values: &[Value]) -> Result<Vec<(String, &Value)>> {
        let mut out: Vec<(String, &Value)> = Vec::with_capacity(values.len());
        for value in values {
            if value.is_null() {
                continue;
            }
            let canonical = serde_json::to_string(value)?;
            match out.iter_mut().find(|(existing, _)| *existing == canonical) {
                Some(slot) => slot.1 = value,
                None => out.push((canonical, value)),
            }
        }
        Ok(out)
    }
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(_) | Value::Number(_))
}

/// Integer and floating-point fast routes share the update algorithms
/// through this small adapter.
#[derive(Clone, Copy)]
enum NumericAmount {
    Int(i64),
    Float(f64),
}

impl NumericAmount {
    fn zero(self) -> Self {
        match self {
            NumericAmount::Int(_) => NumericAmount::Int(0),
            NumericAmount::Float(_) => NumericAmount::Float(0.0),
        }
    }

    fn to_value(self) -> Value {
        match self {
            NumericAmount::Int(v) => Value::from(v),
            // a float with no fractional part stores as an integer so
            // integer reads keep working
            NumericAmount::Float(v) => {
                if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
                    Value::from(v as i64)
                } else {
                    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
                }
            }
        }
    }

    fn parse(self, value: &Value) -> Option<NumericAmount> {
        match self {
            NumericAmount::Int(_) => match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            }
            .map(NumericAmount::Int),
            NumericAmount::Float(_) => match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            }
            .map(NumericAmount::Float),
        }
    }

    fn add(self, other: NumericAmount) -> NumericAmount {
        match (self, other) {
            (NumericAmount::Int(a), NumericAmount::Int(b)) => {
                NumericAmount::Int(a.wrapping_add(b))
            }
            (NumericAmount::Float(a), NumericAmount::Float(b)) => NumericAmount::Float(a + b),
            (NumericAmount::Int(a), NumericAmount::Float(b)) => {
                NumericAmount::Int(a.wrapping_add(b as i64))
            }
            (NumericAmount::Float(a), NumericAmount::Int(b)) => NumericAmount::Float(a + b as f64),
        }
    }

    fn gt(self, other: NumericAmount) -> bool {
        match (self, other) {
            (NumericAmount::Int(a), NumericAmount::Int(b)) => a > b,
            (NumericAmount::Float(a), NumericAmount::Float(b)) => a > b,
            (NumericAmount::Int(a), NumericAmount::Float(b)) => (a as f64) > b,
            (NumericAmount::Float(a), NumericAmount::Int(b)) => a > b as f64,
        }
    }

    fn lt(self, other: NumericAmount) -> bool {
        match (self, other) {
            (NumericAmount::Int(a), NumericAmount::Int(b)) => a < b,
            (NumericAmount::Float(a), NumericAmount::Float(b)) => a < b,
            (NumericAmount::Int(a), NumericAmount::Float(b)) => (a as f64) < b,
            (NumericAmount::Float(a), NumericAmount::Int(b)) => a < b as f64,
        }
    }

    fn diff(self, other: NumericAmount) -> NumericAmount {
        match (self, other) {
            (NumericAmount::Int(a), NumericAmount::Int(b)) => NumericAmount::Int((a - b).abs()),
            (NumericAmount::Float(a), NumericAmount::Float(b)) => NumericAmount::Float((a - b).abs()),
            (NumericAmount::Int(a), NumericAmount::Float(b)) => {
                NumericAmount::Int((a as f64 - b).abs() as i64)
            }
            (NumericAmount::Float(a), NumericAmount::Int(b)) => {
                NumericAmount::Float((a - b as f64).abs())
            }
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            NumericAmount::Int(v) => v,
            NumericAmount::Float(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            NumericAmount::Int(v) => v as f64,
            NumericAmount::Float(v) => v,
        }
    }
}

#[async_trait]
impl CacheClient for InMemoryCache {
    fn strict_serialization(&self) -> bool {
        self.inner.config.throw_on_serialization_error
    }

    async fn get_raw(&self, key: &str) -> Result<CacheValue<RawValue>> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        match self.lookup(key) {
            Lookup::Missing => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheValue::Missing)
            }
            Lookup::Value(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
        }
    }

    async fn get_all_raw(&self, keys: &[&str]) -> Result<HashMap<String, CacheValue<RawValue>>> {
        validate_keys(keys)?;
        self.inner.check_disposed()?;
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = match self.lookup(key) {
                Lookup::Missing => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    CacheValue::Missing
                }
                Lookup::Value(value) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    value
                }
            };
            out.insert((*key).to_string(), value);
        }
        Ok(out)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        let now = self.inner.now();
        let mut reap: Option<u64> = None;
        let present = match self.inner.entries.get(key) {
            None => false,
            Some(entry) => {
                if entry.is_expired(now) {
                    reap = Some(entry.instance_number);
                    false
                } else {
                    true
                }
            }
        };
        if let Some(instance_number) = reap {
            self.inner.reap_expired(key, instance_number);
        }
        Ok(present)
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        let now = self.inner.now();
        let mut reap: Option<u64> = None;
        let remaining = match self.inner.entries.get(key) {
            None => None,
            Some(entry) => {
                if entry.is_expired(now) {
                    reap = Some(entry.instance_number);
                    None
                } else {
                    entry.ttl_remaining(now)
                }
            }
        };
        if let Some(instance_number) = reap {
            self.inner.reap_expired(key, instance_number);
        }
        Ok(remaining)
    }

    async fn get_all_expirations(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<Duration>>> {
        validate_keys(keys)?;
        self.inner.check_disposed()?;
        let now = self.inner.now();
        let mut out = HashMap::new();
        for key in keys {
            let Some(entry) = self.inner.entries.get(*key) else {
                continue;
            };
            if entry.is_expired(now) {
                continue;
            }
            out.insert((*key).to_string(), entry.ttl_remaining(now));
        }
        Ok(out)
    }

    async fn set_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.put_scalar(key, value, ttl, WriteMode::Set)
    }

    async fn add_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.put_scalar(key, value, ttl, WriteMode::Add)
    }

    async fn replace_raw(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.put_scalar(key, value, ttl, WriteMode::Replace)
    }

    async fn replace_if_equal_raw(
        &self,
        key: &str,
        value: Value,
        expected: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;

        if is_delete_ttl(ttl) {
            self.inner.take_entry(key);
            return Ok(false);
        }

        let size = self.inner.measure_value(&value);
        if !self.inner.entry_size_ok(size, json_type_name(&value))? {
            return Ok(false);
        }

        let now = self.inner.now();
        let replaced = match self.inner.entries.get_mut(key) {
            None => false,
            Some(mut entry) => {
                if entry.is_expired(now) {
                    false
                } else if entry.scalar().is_some_and(|v| v.as_ref() == &expected) {
                    let old_size = entry.size;
                    entry.payload = Payload::Scalar(Arc::new(value));
                    entry.expires_at = expiry_for(now, ttl);
                    entry.last_access = now;
                    entry.last_modified = now;
                    entry.instance_number = next_instance_number();
                    entry.size = size;
                    self.inner.apply_size_delta(old_size, size);
                    true
                } else {
                    false
                }
            }
        };

        if replaced {
            self.inner.mark_write();
            self.finish_write();
        }
        Ok(replaced)
    }

    async fn set_all_raw(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        for key in items.keys() {
            validate_key(key)?;
        }
        self.inner.check_disposed()?;

        if is_delete_ttl(ttl) {
            for key in items.keys() {
                self.inner.take_entry(key);
            }
            return Ok(0);
        }

        let mut written = 0;
        for (key, value) in items {
            if self.put_scalar(&key, value, ttl, WriteMode::Set)? {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        let now = self.inner.now();
        match self.inner.take_entry(key) {
            Some(entry) => {
                self.inner.mark_write();
                Ok(!entry.is_expired(now))
            }
            None => Ok(false),
        }
    }

    async fn remove_if_equal_raw(&self, key: &str, expected: Value) -> Result<bool> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        let now = self.inner.now();
        let mut removed = false;
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            if !entry.is_expired(now) && entry.scalar().is_some_and(|v| v.as_ref() == &expected) {
                // back-date the expiration; maintenance reclaims the slot
                entry.expires_at = Some(now);
                entry.last_modified = now;
                removed = true;
            }
        }
        if removed {
            self.inner.mark_write();
            schedule_maintenance(&self.inner);
        }
        Ok(removed)
    }

    async fn remove_all(&self, keys: Option<&[&str]>) -> Result<usize> {
        self.inner.check_disposed()?;
        match keys {
            None | Some([]) => {
                let count = self.inner.entries.len();
                self.inner.entries.clear();
                self.inner.memory.store(0, Ordering::Release);
                self.inner.mark_write();
                Ok(count)
            }
            Some(keys) => {
                validate_keys(keys)?;
                let mut removed = 0;
                for key in keys {
                    if self.inner.take_entry(key).is_some() {
                        removed += 1;
                        self.inner.mark_write();
                    }
                }
                Ok(removed)
            }
        }
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.check_disposed()?;
        if prefix.is_empty() {
            return self.remove_all(None).await;
        }
        let matching: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|item| item.key().starts_with(prefix))
            .map(|item| item.key().clone())
            .collect();
        let mut removed = 0;
        for key in &matching {
            if self.inner.take_entry(key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.inner.mark_write();
        }
        Ok(removed)
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.increment_number(key, NumericAmount::Int(amount), ttl)
            .map(NumericAmount::as_i64)
    }

    async fn increment_float(&self, key: &str, amount: f64, ttl: Option<Duration>) -> Result<f64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.increment_number(key, NumericAmount::Float(amount), ttl)
            .map(NumericAmount::as_f64)
    }

    async fn set_if_higher(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.set_if_bound(key, NumericAmount::Int(value), ttl, true)
            .map(NumericAmount::as_i64)
    }

    async fn set_if_higher_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.set_if_bound(key, NumericAmount::Float(value), ttl, true)
            .map(NumericAmount::as_f64)
    }

    async fn set_if_lower(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<i64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.set_if_bound(key, NumericAmount::Int(value), ttl, false)
            .map(NumericAmount::as_i64)
    }

    async fn set_if_lower_float(
        &self,
        key: &str,
        value: f64,
        ttl: Option<Duration>,
    ) -> Result<f64> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        self.set_if_bound(key, NumericAmount::Float(value), ttl, false)
            .map(NumericAmount::as_f64)
    }

    async fn list_add_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        if values.is_empty() {
            return Ok(0);
        }

        let additions = Self::canonical_keys(&values)?;
        if additions.is_empty() {
            return Ok(0);
        }

        if is_delete_ttl(ttl) {
            // a non-positive ttl removes the listed elements instead
            let canonical: Vec<String> = additions.into_iter().map(|(k, _)| k).collect();
            self.remove_list_elements(key, &canonical, None)?;
            return Ok(0);
        }

        let now = self.inner.now();
        let element_expiry = expiry_for(now, ttl);
        let count = additions.len();

        match self.inner.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let expired = occupied.get().is_expired(now);
                let entry = occupied.get_mut();
                if expired || !matches!(entry.payload, Payload::List(_)) {
                    if !expired && !matches!(entry.payload, Payload::List(_)) {
                        return Err(CacheError::Failure(format!(
                            "key {key:?} holds a non-list value"
                        )));
                    }
                    let mut elements = IndexMap::with_capacity(count);
                    for (canonical, value) in additions {
                        elements.insert(
                            canonical,
                            ListElement {
                                value: Arc::new(value.clone()),
                                expires_at: element_expiry,
                            },
                        );
                    }
                    let expires_at = list_expiration(&elements);
                    let size = self.inner.measure_elements(&elements);
                    let old_size = entry.size;
                    *entry = CacheEntry::new(Payload::List(elements), expires_at, now, size);
                    self.inner.apply_size_delta(old_size, size);
                } else {
                    let old_size = entry.size;
                    let Payload::List(elements) = &mut entry.payload else {
                        unreachable!("checked above");
                    };
                    elements.retain(|_, el| !el.is_expired(now));
                    for (canonical, value) in additions {
                        match elements.get_mut(&canonical) {
                            // duplicate add refreshes the element expiration
                            Some(element) => element.expires_at = element_expiry,
                            None => {
                                elements.insert(
                                    canonical,
                                    ListElement {
                                        value: Arc::new(value.clone()),
                                        expires_at: element_expiry,
                                    },
                                );
                            }
                        }
                    }
                    entry.expires_at = list_expiration(elements);
                    entry.size = self.inner.measure_elements(elements);
                    entry.last_access = now;
                    entry.last_modified = now;
                    let new_size = entry.size;
                    self.inner.apply_size_delta(old_size, new_size);
                }
            }
            MapEntry::Vacant(vacant) => {
                let mut elements = IndexMap::with_capacity(count);
                for (canonical, value) in additions {
                    elements.insert(
                        canonical,
                        ListElement {
                            value: Arc::new(value.clone()),
                            expires_at: element_expiry,
                        },
                    );
                }
                let expires_at = list_expiration(&elements);
                let size = self.inner.measure_elements(&elements);
                vacant.insert(CacheEntry::new(Payload::List(elements), expires_at, now, size));
                self.inner.add_memory(size);
            }
        }

        self.inner.mark_write();
        self.finish_write();
        Ok(count)
    }

    async fn list_remove_raw(
        &self,
        key: &str,
        values: Vec<Value>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        if values.is_empty() {
            return Ok(0);
        }

        if is_delete_ttl(ttl) {
            self.inner.take_entry(key);
            self.inner.mark_write();
            return Ok(0);
        }

        let canonical: Vec<String> = Self::canonical_keys(&values)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let removed = self.remove_list_elements(key, &canonical, ttl)?;
        if removed > 0 {
            self.inner.mark_write();
            self.finish_write();
        }
        Ok(removed)
    }

    async fn get_list_raw(
        &self,
        key: &str,
        page: Option<usize>,
        page_size: usize,
    ) -> Result<CacheValue<Vec<RawValue>>> {
        validate_key(key)?;
        self.inner.check_disposed()?;
        if page_size == 0 {
            return Err(CacheError::invalid_argument("page_size must be positive"));
        }
        if page == Some(0) {
            return Err(CacheError::invalid_argument("page is 1-based"));
        }

        let now = self.inner.now();
        let mut reap: Option<u64> = None;
        let outcome: Result<CacheValue<Vec<RawValue>>> = match self.inner.entries.get_mut(key) {
            None => Ok(CacheValue::Missing),
            Some(mut entry) => {
                let entry = entry.value_mut();
                if entry.is_expired(now) {
                    reap = Some(entry.instance_number);
                    Ok(CacheValue::Missing)
                } else {
                    let clone_on_access = self.inner.config.clone_on_access;
                    let live = match &entry.payload {
                        Payload::Scalar(_) => Err(CacheError::Failure(format!(
                            "key {key:?} holds a non-list value"
                        ))),
                        Payload::List(elements) => Ok(elements
                            .values()
                            .filter(|el| !el.is_expired(now))
                            .map(|el| {
                                if clone_on_access && !is_primitive(&el.value) {
                                    Arc::new(el.value.as_ref().clone())
                                } else {
                                    Arc::clone(&el.value)
                                }
                            })
                            .collect::<Vec<RawValue>>()),
                    };
                    match live {
                        Err(err) => Err(err),
                        Ok(live) if live.is_empty() => Ok(CacheValue::Missing),
                        Ok(live) => {
                            entry.touch(now);
                            let items = match page {
                                None => live,
                                Some(p) => live
                                    .into_iter()
                                    .skip((p - 1) * page_size)
                                    .take(page_size)
                                    .collect(),
                            };
                            Ok(CacheValue::Value(items))
                        }
                    }
                }
            }
        };
        if let Some(instance_number) = reap {
            self.inner.reap_expired(key, instance_number);
        }

        match outcome {
            Ok(CacheValue::Missing) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheValue::Missing)
            }
            Ok(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        validate_key(key)?;
        self.inner.check_disposed()?;

        if ttl.is_zero() {
            if self.inner.take_entry(key).is_some() {
                self.inner.mark_write();
            }
            return Ok(());
        }

        let now = self.inner.now();
        let mut updated = false;
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = expiry_for(now, Some(ttl));
                entry.last_modified = now;
                updated = true;
            }
        }
        if updated {
            self.inner.mark_write();
            schedule_maintenance(&self.inner);
        }
        Ok(())
    }

    async fn set_all_expirations(
        &self,
        expirations: HashMap<String, Option<Duration>>,
    ) -> Result<()> {
        for key in expirations.keys() {
            validate_key(key)?;
        }
        self.inner.check_disposed()?;

        let now = self.inner.now();
        for (key, ttl) in expirations {
            match ttl {
                Some(d) if d.is_zero() => {
                    self.inner.take_entry(&key);
                }
                ttl => {
                    if let Some(mut entry) = self.inner.entries.get_mut(&key) {
                        if !entry.is_expired(now) {
                            entry.expires_at = expiry_for(now, ttl);
                            entry.last_modified = now;
                        }
                    }
                }
            }
        }
        self.inner.mark_write();
        schedule_maintenance(&self.inner);
        Ok(())
    }
}

impl InMemoryCache {
    /// Remove the listed canonical elements from a list entry, pruning dead
    /// elements along the way. `ttl` follows the list-remove row of the
    /// operation table.
    fn remove_list_elements(
        &self,
        key: &str,
        canonical: &[String],
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let now = self.inner.now();
        let mut drop_entry = false;
        let mut removed = 0;

        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            let entry = entry.value_mut();
            if entry.is_expired(now) {
                return Ok(0);
            }
            let old_size = entry.size;
            let Payload::List(elements) = &mut entry.payload else {
                return Err(CacheError::Failure(format!(
                    "key {key:?} holds a non-list value"
                )));
            };
            elements.retain(|_, el| !el.is_expired(now));
            for canon in canonical {
                if elements.shift_remove(canon).is_some() {
                    removed += 1;
                }
            }
            if elements.is_empty() {
                drop_entry = true;
            } else {
                entry.expires_at = match ttl {
                    Some(d) => expiry_for(now, Some(d)),
                    None => list_expiration(elements),
                };
                entry.size = self.inner.measure_elements(elements);
                entry.last_access = now;
                entry.last_modified = now;
                let new_size = entry.size;
                self.inner.apply_size_delta(old_size, new_size);
            }
        }

        if drop_entry {
            self.inner.take_entry(key);
        }
        Ok(removed)
    }
}
