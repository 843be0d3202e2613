//! Decision cache collaborator

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::CheckResult;

/// Cache trait
///
/// Keys are opaque strings built by the engine (`check:{user_id}:{fingerprint}`).
/// Patterns passed to [`CacheProvider::invalidate_pattern`] may end in `*`
/// to match a prefix.
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<CheckResult>;

    fn set(&self, key: &str, value: CheckResult, ttl: Duration);

    fn invalidate(&self, key: &str);

    /// Remove every key matching `pattern`, returning how many were removed
    fn invalidate_pattern(&self, pattern: &str) -> usize;

    fn clear(&self);

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cached entry with TTL
#[derive(Clone)]
struct CachedEntry {
    value: CheckResult,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Bounded in-memory cache with per-entry TTL
///
/// When full, expired entries are dropped first, then the oldest tenth.
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        if self.entries.len() < self.capacity {
            self.expirations
                .fetch_add((before - self.entries.len()) as u64, Ordering::Relaxed);
            return;
        }

        let mut ages: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.cached_at))
            .collect();
        ages.sort_by_key(|(_, cached_at)| *cached_at);

        let to_remove = (self.capacity / 10).max(1);
        for (key, _) in ages.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        self.evictions.fetch_add(to_remove as u64, Ordering::Relaxed);
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheProvider for InMemoryCache {
    fn get(&self, key: &str) -> Option<CheckResult> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &str, value: CheckResult, ttl: Duration) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(key) {
            self.evict();
        }

        self.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    fn invalidate_pattern(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        match pattern.strip_suffix('*') {
            Some(prefix) => self.entries.retain(|key, _| !key.starts_with(prefix)),
            None => {
                self.entries.remove(pattern);
            }
        }
        before.saturating_sub(self.entries.len())
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            max_entries: self.capacity,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
