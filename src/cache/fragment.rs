//! FragmentCache (spec.md §4.3): bounded, LRU-evicted HTML fragment store
//! keyed by an opaque evaluator-supplied string.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

#[derive(Clone)]
struct FragmentEntry {
    html: String,
    expires_at: Instant,
}

pub struct FragmentCache {
    dev_mode: bool,
    disabled: std::sync::atomic::AtomicBool,
    entries: RwLock<LruCache<String, FragmentEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct FragmentStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: usize,
    pub dev_mode: bool,
    pub hit_rate: f64,
}

impl FragmentCache {
    /// `dev_override`, when true, keeps the cache active even in dev mode
    /// (spec.md §3 invariant 5: a consistent `disabled` flag unless an
    /// explicit override is configured).
    pub fn new(dev_mode: bool, dev_override: bool, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            dev_mode,
            disabled: std::sync::atomic::AtomicBool::new(dev_mode && !dev_override),
            entries: RwLock::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// `Get(key) → (html, hit)`. Counters increment on every lookup,
    /// including misses in dev mode (spec.md §4.3).
    pub fn get(&self, key: &str) -> (Option<String>, bool) {
        if self.is_disabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (None, false);
        }

        let mut guard = self.entries.write().unwrap();
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                (Some(entry.html.clone()), true)
            }
            Some(_) => {
                guard.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                (None, false)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                (None, false)
            }
        }
    }

    /// `Set(key, html, ttl)`. Negative-or-zero TTL is a no-op. Empty
    /// content is a legal value. Eviction is LRU on insertion when full.
    pub fn set(&self, key: String, html: String, ttl: Duration) {
        if self.is_disabled() || ttl.is_zero() {
            return;
        }
        self.entries.write().unwrap().put(
            key,
            FragmentEntry {
                html,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.write().unwrap().pop(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut guard = self.entries.write().unwrap();
        let stale: Vec<String> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            guard.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn stats(&self) -> FragmentStats {
        let guard = self.entries.read().unwrap();
        let entries = guard.len();
        let size_bytes = guard.iter().map(|(k, v)| k.len() + v.html.len()).sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        FragmentStats {
            entries,
            hits,
            misses,
            size_bytes,
            dev_mode: self.dev_mode,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_immediately_after_set_then_miss_after_ttl() {
        let cache = FragmentCache::new(false, false, 10);
        cache.set("k".into(), "<p>hi</p>".into(), Duration::from_millis(20));
        let (html, hit) = cache.get("k");
        assert!(hit);
        assert_eq!(html.as_deref(), Some("<p>hi</p>"));

        std::thread::sleep(Duration::from_millis(40));
        let (_, hit) = cache.get("k");
        assert!(!hit);
    }

    #[test]
    fn zero_ttl_is_a_noop() {
        let cache = FragmentCache::new(false, false, 10);
        cache.set("k".into(), "x".into(), Duration::ZERO);
        assert!(!cache.get("k").1);
    }

    #[test]
    fn lru_evicts_when_full() {
        let cache = FragmentCache::new(false, false, 2);
        cache.set("a".into(), "a".into(), Duration::from_secs(60));
        cache.set("b".into(), "b".into(), Duration::from_secs(60));
        // touch "a" so "b" becomes least-recently-used
        cache.get("a");
        cache.set("c".into(), "c".into(), Duration::from_secs(60));

        assert!(!cache.get("b").1);
        assert!(cache.get("a").1);
        assert!(cache.get("c").1);
    }

    #[test]
    fn invalidate_prefix_removes_matching_keys_only() {
        let cache = FragmentCache::new(false, false, 10);
        cache.set("page:a".into(), "a".into(), Duration::from_secs(60));
        cache.set("page:b".into(), "b".into(), Duration::from_secs(60));
        cache.set("other:c".into(), "c".into(), Duration::from_secs(60));

        cache.invalidate_prefix("page:");

        assert!(!cache.get("page:a").1);
        assert!(!cache.get("page:b").1);
        assert!(cache.get("other:c").1);
    }

    #[test]
    fn counters_increment_on_every_lookup_including_dev_mode_misses() {
        let cache = FragmentCache::new(true, false, 10);
        cache.set("k".into(), "v".into(), Duration::from_secs(60));
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert!(stats.dev_mode);
    }
}
