//! In-process LRU fallback cache for cache/KV degradation.
//!
//! When the remote KV store is unreachable (or its breaker is open),
//! operations degrade to this bounded, TTL-aware map. Reads of missing or
//! expired keys return `None` silently; inserts evict the least recently
//! used entry once the size bound is hit.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// Mutex-protected LRU map bounded by entry count and per-entry TTL.
#[derive(Debug)]
pub struct FallbackCache {
    max_entries: usize,
    default_ttl: Duration,
    inner: Mutex<FallbackInner>,
}

#[derive(Debug, Default)]
struct FallbackInner {
    entries: FxHashMap<String, CacheEntry>,
    // Recency order, oldest first. Touched keys are re-pushed; stale
    // occurrences are skipped during eviction.
    order: VecDeque<String>,
}

impl FallbackCache {
    #[must_use]
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            default_ttl,
            inner: Mutex::new(FallbackInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|t| Instant::now() >= t),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.order.push_back(key.to_string());
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        inner.order.push_back(key.to_string());
        self.evict_locked(&mut inner);
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, inner: &mut FallbackInner) {
        while inner.entries.len() > self.max_entries {
            let Some(candidate) = inner.order.pop_front() else {
                break;
            };
            // A key re-pushed later in the queue is still recent; only evict
            // when this is its last queued occurrence.
            if inner.order.iter().any(|k| *k == candidate) {
                continue;
            }
            inner.entries.remove(&candidate);
        }
        // Keep the recency queue from growing unbounded under heavy reuse.
        if inner.order.len() > self.max_entries * 8 {
            let entries = &inner.entries;
            let mut seen = FxHashMap::default();
            for (idx, key) in inner.order.iter().enumerate() {
                if entries.contains_key(key) {
                    seen.insert(key.clone(), idx);
                }
            }
            let mut order: Vec<(usize, String)> =
                seen.into_iter().map(|(k, idx)| (idx, k)).collect();
            order.sort_unstable_by_key(|(idx, _)| *idx);
            inner.order = order.into_iter().map(|(_, k)| k).collect();
        }
    }
}
