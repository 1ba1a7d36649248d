//! Two-tier response cache with in-flight deduplication
//!
//! The hot tier is a tiny linear array of the most recently touched keys, the
//! main tier a capacity-bounded map with LRU eviction. Both carry a TTL that is
//! checked on access and by a periodic sweep. Concurrent misses for one key share
//! a single fetch.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::metrics::Metrics;
use crate::rpc_config::CacheConfig;
use crate::rpc_errors::RpcError;

/// 128-bit request fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 16]);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Fingerprint of `(namespace, method, params)` over canonical JSON.
///
/// Object keys are sorted recursively so requests differing only in key order
/// map to the same key.
pub fn fingerprint(namespace: &str, method: &str, params: &Value) -> CacheKey {
    let mut canonical = String::with_capacity(64);
    write_canonical(params, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    CacheKey(key)
}

pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Serialize `value` as JSON with object keys in sorted order
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A cached outcome; failures are tagged so a success replaces them
#[derive(Debug, Clone)]
pub enum CachedValue {
    Success(Value),
    Failure(RpcError),
}

impl CachedValue {
    fn into_result(self) -> Result<Value, RpcError> {
        match self {
            CachedValue::Success(value) => Ok(value),
            CachedValue::Failure(err) => Err(err),
        }
    }
}

#[derive(Debug)]
struct HotSlot {
    key: CacheKey,
    value: CachedValue,
    expires_at: Instant,
    touched: u64,
}

#[derive(Debug)]
struct MainEntry {
    value: CachedValue,
    expires_at: Instant,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    hot: Vec<HotSlot>,
    main: HashMap<CacheKey, MainEntry>,
    /// tick -> key, oldest first
    lru: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_main(&mut self, key: &CacheKey) -> Option<MainEntry> {
        let entry = self.main.remove(key)?;
        self.lru.remove(&entry.tick);
        Some(entry)
    }

    fn remove_hot(&mut self, key: &CacheKey) -> bool {
        match self.hot.iter().position(|slot| slot.key == *key) {
            Some(idx) => {
                self.hot.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    fn put_hot(&mut self, capacity: usize, key: CacheKey, value: CachedValue, expires_at: Instant) {
        let touched = self.next_tick();
        if let Some(slot) = self.hot.iter_mut().find(|slot| slot.key == key) {
            slot.value = value;
            slot.expires_at = expires_at;
            slot.touched = touched;
            return;
        }
        let slot = HotSlot {
            key,
            value,
            expires_at,
            touched,
        };
        if self.hot.len() < capacity {
            self.hot.push(slot);
        } else if let Some(coldest) = self.hot.iter_mut().min_by_key(|slot| slot.touched) {
            *coldest = slot;
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hot_hits: AtomicU64,
    main_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub main_hits: u64,
    pub misses: u64,
    pub coalesced_waiters: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hot_entries: usize,
    pub main_entries: usize,
    pub pending_fetches: usize,
    pub hit_rate: f64,
}

/// In-flight fetch tagged with the id that owns the right to store its outcome
struct PendingFetch {
    id: u64,
    shared: Shared<BoxFuture<'static, Result<Value, RpcError>>>,
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    pending: DashMap<CacheKey, PendingFetch>,
    next_fetch: AtomicU64,
    counters: CacheCounters,
    metrics: Arc<Metrics>,
}

impl CacheInner {
    fn lookup(&self, key: &CacheKey, record: bool) -> Option<CachedValue> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(idx) = state.hot.iter().position(|slot| slot.key == *key) {
            if state.hot[idx].expires_at > now {
                let touched = state.next_tick();
                let slot = &mut state.hot[idx];
                slot.touched = touched;
                if record {
                    self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .cache_lookups_total
                        .with_label_values(&["hot_hit"])
                        .inc();
                }
                return Some(slot.value.clone());
            }
            state.hot.swap_remove(idx);
        }

        let expired = match state.main.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => {
                if record {
                    self.record_miss();
                }
                return None;
            }
        };

        if expired {
            state.remove_main(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_entries.set(state.main.len() as i64);
            if record {
                self.record_miss();
            }
            return None;
        }

        let tick = state.next_tick();
        let (value, expires_at) = {
            let Some(entry) = state.main.get_mut(key) else {
                return None;
            };
            let old_tick = std::mem::replace(&mut entry.tick, tick);
            let hit = (entry.value.clone(), entry.expires_at);
            state.lru.remove(&old_tick);
            hit
        };
        state.lru.insert(tick, *key);
        state.put_hot(self.config.hot_capacity, *key, value.clone(), expires_at);

        if record {
            self.counters.main_hits.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .cache_lookups_total
                .with_label_values(&["main_hit"])
                .inc();
        }
        Some(value)
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .cache_lookups_total
            .with_label_values(&["miss"])
            .inc();
    }

    fn store(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + ttl;
        let mut state = self.state.lock();
        let tick = state.next_tick();

        if let Some(old) = state.main.remove(&key) {
            state.lru.remove(&old.tick);
        } else if state.main.len() >= self.config.main_capacity {
            if let Some((_, victim)) = state.lru.pop_first() {
                state.main.remove(&victim);
                state.remove_hot(&victim);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_evictions_total.inc();
                trace!(key = %victim, "Evicted least recently used entry");
            }
        }

        if state.hot.iter().any(|slot| slot.key == key) {
            state.put_hot(self.config.hot_capacity, key, value.clone(), expires_at);
        }
        state.main.insert(
            key,
            MainEntry {
                value,
                expires_at,
                tick,
            },
        );
        state.lru.insert(tick, key);
        self.metrics.cache_entries.set(state.main.len() as i64);
    }

    fn store_outcome(&self, key: CacheKey, outcome: &Result<Value, RpcError>, ttl: Duration) {
        match outcome {
            Ok(value) => self.store(key, CachedValue::Success(value.clone()), ttl),
            // Only node answers about the key itself are worth remembering
            Err(err @ RpcError::RpcResponse { .. }) => {
                let error_ttl = Duration::from_millis(self.config.error_ttl_ms).min(ttl);
                self.store(key, CachedValue::Failure(err.clone()), error_ttl);
            }
            Err(_) => {}
        }
    }
}

/// Cheaply cloneable handle to one cache instance
#[derive(Clone)]
pub struct TwoTierCache {
    inner: Arc<CacheInner>,
}

impl TwoTierCache {
    pub fn new(config: CacheConfig, metrics: Arc<Metrics>) -> Self {
        let hot_capacity = config.hot_capacity;
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    hot: Vec::with_capacity(hot_capacity),
                    ..CacheState::default()
                }),
                pending: DashMap::new(),
                next_fetch: AtomicU64::new(0),
                counters: CacheCounters::default(),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn key_for(&self, method: &str, params: &Value) -> CacheKey {
        fingerprint(&self.inner.config.namespace, method, params)
    }

    /// Cached value for `key`, if present and fresh
    pub fn peek(&self, key: &CacheKey) -> Option<CachedValue> {
        self.inner.lookup(key, true)
    }

    /// Return the cached outcome or run `fetch` once for all concurrent callers
    pub async fn get<F, Fut>(&self, key: CacheKey, ttl: Duration, fetch: F) -> Result<Value, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        if let Some(cached) = self.inner.lookup(&key, true) {
            return cached.into_result();
        }

        let shared = match self.inner.pending.entry(key) {
            Entry::Occupied(entry) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .metrics
                    .cache_lookups_total
                    .with_label_values(&["coalesced"])
                    .inc();
                trace!(key = %key, "Joined in-flight fetch");
                entry.get().shared.clone()
            }
            Entry::Vacant(entry) => {
                // A fetch may have completed between the miss and this point
                if let Some(cached) = self.inner.lookup(&key, false) {
                    return cached.into_result();
                }

                let inner = self.inner.clone();
                let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
                let operation = fetch();
                let shared = async move {
                    let outcome = operation.await;
                    // An invalidation while in flight detaches this fetch
                    if inner.pending.remove_if(&key, |_, p| p.id == id).is_some() {
                        inner.store_outcome(key, &outcome, ttl);
                    } else {
                        trace!(key = %key, "Dropped outcome of invalidated fetch");
                    }
                    outcome
                }
                .boxed()
                .shared();
                entry.insert(PendingFetch {
                    id,
                    shared: shared.clone(),
                });
                shared
            }
        };

        shared.await
    }

    pub fn set(&self, key: CacheKey, value: Value, ttl: Duration) {
        self.inner.store(key, CachedValue::Success(value), ttl);
    }

    /// Drop `key` from both tiers and detach any fetch still running for it.
    ///
    /// Waiters already joined to that fetch still get its outcome, but it is
    /// never stored and the next `get` starts a fresh fetch.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let detached = self.inner.pending.remove(key).is_some();
        let mut state = self.inner.state.lock();
        let in_hot = state.remove_hot(key);
        let in_main = state.remove_main(key).is_some();
        self.inner.metrics.cache_entries.set(state.main.len() as i64);
        in_hot || in_main || detached
    }

    pub fn clear(&self) {
        self.inner.pending.clear();
        let mut state = self.inner.state.lock();
        state.hot.clear();
        state.main.clear();
        state.lru.clear();
        self.inner.metrics.cache_entries.set(0);
    }

    /// Drop every expired entry from both tiers
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.hot.retain(|slot| slot.expires_at > now);

        let expired: Vec<CacheKey> = state
            .main
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            state.remove_main(key);
        }

        self.inner
            .counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.inner.metrics.cache_entries.set(state.main.len() as i64);
        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = state.main.len(), "Cache sweep");
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let hot_hits = c.hot_hits.load(Ordering::Relaxed);
        let main_hits = c.main_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hot_hits + main_hits + misses;
        let (hot_entries, main_entries) = {
            let state = self.inner.state.lock();
            (state.hot.len(), state.main.len())
        };

        CacheStats {
            hot_hits,
            main_hits,
            misses,
            coalesced_waiters: c.coalesced.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            hot_entries,
            main_entries,
            pending_fetches: self.inner.pending.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hot_hits + main_hits) as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache(hot: usize, main: usize) -> TwoTierCache {
        let config = CacheConfig {
            hot_capacity: hot,
            main_capacity: main,
            error_ttl_ms: 100,
            ..CacheConfig::default()
        };
        TwoTierCache::new(config, Arc::new(Metrics::new().unwrap()))
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = fingerprint("ns", "getAccountInfo", &json!([{"encoding": "base64", "commitment": "confirmed"}]));
        let b = fingerprint("ns", "getAccountInfo", &json!([{"commitment": "confirmed", "encoding": "base64"}]));
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 32);

        let other_ns = fingerprint("other", "getAccountInfo", &json!([{"encoding": "base64", "commitment": "confirmed"}]));
        assert_ne!(a, other_ns);
        let other_method = fingerprint("ns", "getBalance", &json!([{"encoding": "base64", "commitment": "confirmed"}]));
        assert_ne!(a, other_method);
    }

    #[tokio::test(start_paused = true)]
    async fn test_herd_runs_fetch_once() {
        let cache = cache(4, 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache.key_for("getSlot", &json!([]));

        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get(key, Duration::from_secs(1), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(json!(1234))
                        })
                        .await
                })
            })
            .collect();

        for waiter in futures::future::join_all(waiters).await {
            assert_eq!(waiter.unwrap().unwrap(), json!(1234));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.pending_fetches, 0);
        assert!(stats.coalesced_waiters >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_never_served_after_ttl() {
        let cache = cache(4, 16);
        let key = cache.key_for("getSlot", &json!([]));
        cache.set(key, json!("v1"), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(matches!(cache.peek(&key), Some(CachedValue::Success(v)) if v == json!("v1")));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.peek(&key).is_none());

        let fetched = cache
            .get(key, Duration::from_millis(100), || async { Ok(json!("v2")) })
            .await
            .unwrap();
        assert_eq!(fetched, json!("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let cache = cache(1, 2);
        let k1 = cache.key_for("m", &json!([1]));
        let k2 = cache.key_for("m", &json!([2]));
        let k3 = cache.key_for("m", &json!([3]));
        let ttl = Duration::from_secs(10);

        cache.set(k1, json!(1), ttl);
        cache.set(k2, json!(2), ttl);
        // Touch k1 so k2 becomes the eviction victim
        assert!(cache.peek(&k1).is_some());
        cache.set(k3, json!(3), ttl);

        assert!(cache.peek(&k2).is_none());
        assert!(cache.peek(&k1).is_some());
        assert!(cache.peek(&k3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cached_briefly_and_overwritten() {
        let cache = cache(4, 16);
        let key = cache.key_for("getAccountInfo", &json!(["missing"]));
        let err = RpcError::RpcResponse {
            endpoint: "http://a.local".to_string(),
            code: -32602,
            message: "invalid param".to_string(),
        };

        let first = cache
            .get(key, Duration::from_secs(5), || {
                let err = err.clone();
                async move { Err(err) }
            })
            .await;
        assert!(first.is_err());
        assert!(matches!(cache.peek(&key), Some(CachedValue::Failure(_))));

        cache.set(key, json!({"value": null}), Duration::from_secs(5));
        assert!(matches!(cache.peek(&key), Some(CachedValue::Success(_))));

        cache.invalidate(&key);
        let again = cache
            .get(key, Duration::from_secs(5), || {
                let err = err.clone();
                async move { Err(err) }
            })
            .await;
        assert!(again.is_err());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_detaches_in_flight_fetch() {
        let cache = cache(4, 16);
        let key = cache.key_for("getAccountInfo", &json!(["acc"]));
        let ttl = Duration::from_secs(60);

        let stale = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get(key, ttl, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!("old"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.stats().pending_fetches, 1);

        assert!(cache.invalidate(&key));
        assert_eq!(cache.stats().pending_fetches, 0);

        // A get after the invalidation must not join the old fetch
        let fresh = cache
            .get(key, ttl, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("new"))
            })
            .await
            .unwrap();
        assert_eq!(fresh, json!("new"));

        assert_eq!(stale.await.unwrap().unwrap(), json!("old"));
        assert!(matches!(cache.peek(&key), Some(CachedValue::Success(v)) if v == json!("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_fetch_outcome_is_not_stored() {
        let cache = cache(4, 16);
        let key = cache.key_for("getAccountInfo", &json!(["acc"]));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get(key, Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("old"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate(&key);

        assert_eq!(waiter.await.unwrap().unwrap(), json!("old"));
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_not_cached() {
        let cache = cache(4, 16);
        let key = cache.key_for("getSlot", &json!([]));
        let outcome = cache
            .get(key, Duration::from_secs(5), || async {
                Err(RpcError::transport("http://a.local", "reset"))
            })
            .await;
        assert!(outcome.is_err());
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_tier_promotion_and_sweep() {
        let cache = cache(2, 16);
        let key = cache.key_for("getSlot", &json!([]));
        cache.set(key, json!(7), Duration::from_millis(50));

        assert!(cache.peek(&key).is_some());
        assert!(cache.peek(&key).is_some());
        let stats = cache.stats();
        assert_eq!(stats.main_hits, 1);
        assert_eq!(stats.hot_hits, 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cache.sweep_expired(), 1);
        let stats = cache.stats();
        assert_eq!(stats.main_entries, 0);
        assert_eq!(stats.hot_entries, 0);
    }
}
