//! Time-bounded memoization for expensive collaborator lookups.
//!
//! Two expiry shapes are supported:
//!
//! - [`Expiry::PerEntry`] — each entry carries its own refresh timestamp and
//!   is dropped alone once older than the TTL (per-host attributes).
//! - [`Expiry::Wholesale`] — the cache carries one "last modified" timestamp;
//!   once older than the TTL every entry is dropped and the cache is rebuilt
//!   from subsequent misses (per-tenant tag sets).
//!
//! Expiry is lazy: it is checked on access, never by a background sweep.
//! The fetch on a miss runs without holding the lock, so two concurrent
//! misses for the same key may both fetch. The second insert wins.
//!
//! Cache statistics (hits, misses, evictions) are emitted through `tracing`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

/// How stale data is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    PerEntry,
    Wholesale,
}

/// Configuration for a [`TtlCache`].
#[derive(Clone, Debug)]
pub struct TtlCacheConfig {
    /// Retention window (default: 10 minutes).
    pub ttl: Duration,
    /// Maximum number of entries (default: 4096).
    pub max_entries: usize,
    pub expiry: Expiry,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 4096,
            expiry: Expiry::PerEntry,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    refreshed_at: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Start of the current wholesale retention window.
    last_modified: Option<Instant>,
    stats: CacheStats,
}

/// Accumulated cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Thread-safe TTL cache keyed by a stable identifier.
pub struct TtlCache<K, V> {
    name: &'static str,
    config: TtlCacheConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: Clone,
{
    /// Create a cache backed by the system clock.
    pub fn new(name: &'static str, config: TtlCacheConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &'static str, config: TtlCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            config,
            clock,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                last_modified: None,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Return the cached value for `key`, or run `fetch` and store its result.
    ///
    /// `Ok(None)` from `fetch` ("not found") is returned but not cached.
    pub fn get_or_fetch<E, F>(&self, key: &K, fetch: F) -> Result<Option<V>, E>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
    {
        if let Some(value) = self.get(key) {
            return Ok(Some(value));
        }
        let fetched = fetch(key)?;
        if let Some(value) = &fetched {
            self.insert(key.clone(), value.clone());
        }
        Ok(fetched)
    }

    /// Look up a fresh value. Stale data is invalidated on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if !self.is_stale(&inner, key, now) {
                if let Some(entry) = inner.entries.get(key) {
                    let value = entry.value.clone();
                    drop(inner);
                    self.record_hit(key);
                    return Some(value);
                }
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_stale(&inner, key, now) {
            self.invalidate_locked(&mut inner, key);
        }
        inner.stats.misses += 1;
        info!(
            cache = self.name,
            %key,
            cache_hits = inner.stats.hits,
            cache_misses = inner.stats.misses,
            cache_evictions = inner.stats.evictions,
            "cache miss"
        );
        None
    }

    /// Insert or replace a value.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if self.config.expiry == Expiry::Wholesale && inner.last_modified.is_none() {
            inner.last_modified = Some(now);
        }
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_entries {
            self.evict_oldest(&mut inner);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                refreshed_at: now,
            },
        );
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.last_modified = None;
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn is_stale(&self, inner: &Inner<K, V>, key: &K, now: Instant) -> bool {
        match self.config.expiry {
            Expiry::Wholesale => inner
                .last_modified
                .is_some_and(|at| now.saturating_duration_since(at) > self.config.ttl),
            Expiry::PerEntry => inner
                .entries
                .get(key)
                .is_some_and(|e| now.saturating_duration_since(e.refreshed_at) > self.config.ttl),
        }
    }

    fn invalidate_locked(&self, inner: &mut Inner<K, V>, key: &K) {
        match self.config.expiry {
            Expiry::Wholesale => {
                let dropped = inner.entries.len() as u64;
                inner.entries.clear();
                inner.last_modified = None;
                inner.stats.evictions += dropped;
                info!(cache = self.name, dropped, "cache retention window expired");
            }
            Expiry::PerEntry => {
                if inner.entries.remove(key).is_some() {
                    inner.stats.evictions += 1;
                    debug!(cache = self.name, %key, "cache entry expired");
                }
            }
        }
    }

    fn evict_oldest(&self, inner: &mut Inner<K, V>) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.refreshed_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
            info!(
                cache = self.name,
                evicted = %key,
                cache_evictions = inner.stats.evictions,
                "cache capacity eviction"
            );
        }
    }

    fn record_hit(&self, key: &K) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.stats.hits += 1;
        debug!(cache = self.name, %key, cache_hits = inner.stats.hits, "cache hit");
    }
}
