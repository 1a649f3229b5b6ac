//! Bounded response cache with TTL expiry and insertion-order (FIFO) eviction.
//!
//! Entries carry the instant they were stored. [`ResponseCache::get`] only
//! returns entries younger than the TTL; an expired entry is dropped on the
//! read that discovers it. When a [`set`](ResponseCache::set) pushes the map
//! past its capacity, the oldest-inserted key goes first. `order` records
//! insertion order so eviction is deterministic.
//!
//! The cache is `&mut self` throughout. Shared instances live behind a
//! [`SharedCache`], whose lock is held only for one map operation.
//!
//! Time comes from [`tokio::time::Instant`], so a paused test runtime can
//! move the clock past the TTL without sleeping.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheLimits;

/// Entries older than this are treated as absent.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Maximum number of live entries before FIFO eviction.
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid invalidation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Counters since construction or the last [`ResponseCache::clear`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate in percent; `0.0` before the first request.
    pub fn hit_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            n => self.hits as f64 * 100.0 / n as f64,
        }
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

pub struct ResponseCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, Entry<V>>,
    /// Insertion-ordered list of live keys.
    order: VecDeque<String>,
    stats: CacheStats,
}

impl<V: Clone> ResponseCache<V> {
    /// 5 minute TTL, 50 entries.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Cached value for `key` if present and younger than the TTL.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let fresh = match self.entries.get(key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.stored_at.elapsed() < self.ttl,
        };

        if !fresh {
            self.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Store `value` under `key`, stamped with the current instant.
    ///
    /// Re-setting a key moves it to the newest position.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, Entry { value, stored_at: Instant::now() });

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
                debug!(key = %oldest, "cache entry evicted");
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Remove every key matching `pattern`; returns how many were removed.
    pub fn invalidate(&mut self, pattern: &str) -> Result<usize, CacheError> {
        let re = Regex::new(pattern)?;
        Ok(self.invalidate_matching(&re))
    }

    pub fn invalidate_matching(&mut self, re: &Regex) -> usize {
        let doomed: Vec<String> = self.order.iter().filter(|k| re.is_match(k)).cloned().collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        self.order.retain(|k| !re.is_match(k));
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.stats = CacheStats::default();
    }
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ── SharedCache ───────────────────────────────────────────────────────────────

/// A named [`ResponseCache`] behind a mutex, shareable across request tasks.
///
/// A poisoned lock degrades to a miss / no-op instead of panicking: the cache
/// is best-effort and callers always fall through to a live fetch.
pub struct SharedCache<V> {
    name: &'static str,
    inner: Mutex<ResponseCache<V>>,
}

impl<V: Clone> SharedCache<V> {
    pub fn new(name: &'static str, limits: CacheLimits) -> Self {
        Self { name, inner: Mutex::new(ResponseCache::with_limits(limits.ttl, limits.capacity)) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> Option<MutexGuard<'_, ResponseCache<V>>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(cache = self.name, "cache lock poisoned, bypassing");
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let hit = self.lock()?.get(key);
        debug!(cache = self.name, key, hit = hit.is_some(), "cache lookup");
        hit
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if let Some(mut cache) = self.lock() {
            cache.set(key, value);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().map(|mut c| c.remove(key)).unwrap_or(false)
    }

    pub fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let re = Regex::new(pattern)?;
        Ok(self.lock().map(|mut c| c.invalidate_matching(&re)).unwrap_or(0))
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        match self.lock() {
            Some(c) => CacheSnapshot {
                name: self.name,
                size: c.len(),
                capacity: c.capacity(),
                ttl_seconds: c.ttl().as_secs(),
                stats: c.stats(),
            },
            None => CacheSnapshot { name: self.name, size: 0, capacity: 0, ttl_seconds: 0, stats: CacheStats::default() },
        }
    }
}

/// Point-in-time view of one shared cache, as reported by `/api/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub name: &'static str,
    pub size: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    #[serde(flatten)]
    pub stats: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_after_set_within_ttl_returns_value() {
        let mut cache = ResponseCache::new();
        cache.set("/api/lessons", "payload".to_string());
        tokio::time::advance(Duration::from_secs(4 * 60 + 59)).await;
        assert_eq!(cache.get("/api/lessons").as_deref(), Some("payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_ttl_returns_none_and_drops_entry() {
        let mut cache = ResponseCache::new();
        cache.set("k", 1u32);
        tokio::time::advance(DEFAULT_TTL).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_refreshes_timestamp() {
        let mut cache = ResponseCache::new();
        cache.set("k", 1u32);
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.set("k", 2u32);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn earliest_inserted_key_evicted_past_capacity() {
        let mut cache = ResponseCache::new();
        for i in 0..DEFAULT_CAPACITY {
            cache.set(format!("key-{i}"), i);
        }
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert_eq!(cache.get("key-0"), Some(0));

        cache.set("key-new", 999);
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert_eq!(cache.get("key-0"), None);
        assert_eq!(cache.get("key-1"), Some(1));
        assert_eq!(cache.get("key-new"), Some(999));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn upsert_moves_key_to_newest() {
        let mut cache = ResponseCache::with_limits(DEFAULT_TTL, 2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 3);
        cache.set("c", 4);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(3));
        assert_eq!(cache.get("c"), Some(4));
    }

    #[test]
    fn invalidate_removes_matching_keys() {
        let mut cache = ResponseCache::new();
        cache.set("/history?sid=u1", 1);
        cache.set("/history?sid=u2", 2);
        cache.set("/health", 3);

        let removed = cache.invalidate(r"^/history").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("/health"), Some(3));

        // order stays consistent: capacity accounting still works
        for i in 0..DEFAULT_CAPACITY {
            cache.set(format!("x{i}"), i);
        }
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let mut cache: ResponseCache<u8> = ResponseCache::new();
        assert!(matches!(cache.invalidate("(unclosed"), Err(CacheError::Pattern(_))));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let mut cache = ResponseCache::new();
        cache.set("k", 1);
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn shared_cache_snapshot() {
        let shared = SharedCache::new("lessons", CacheLimits { ttl: DEFAULT_TTL, capacity: 10 });
        shared.set("a", "x".to_string());
        assert_eq!(shared.get("a").as_deref(), Some("x"));
        assert_eq!(shared.invalidate("^a$").unwrap(), 1);
        let snap = shared.snapshot();
        assert_eq!(snap.name, "lessons");
        assert_eq!(snap.size, 0);
        assert_eq!(snap.capacity, 10);
        assert_eq!(snap.stats.hits, 1);
    }
}
