//! ResponseCache (spec.md §4.2): full-response store for cacheable GET
//! routes, keyed by SHA-256 of `method:path?rawQuery`.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct ResponseEntry {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    expires_at: Instant,
}

pub struct ResponseCache {
    dev_mode: bool,
    /// When set, caching stays active even in dev mode (spec.md §3
    /// invariant 5: "a consistent `disabled` flag ... unless explicit
    /// override").
    dev_override: bool,
    entries: DashMap<String, ResponseEntry>,
}

/// Cache key: lowercase hex SHA-256 of `method ":" path "?" rawQuery`
/// (spec.md §6).
pub fn cache_key(method: &str, path: &str, raw_query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b"?");
    hasher.update(raw_query.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl ResponseCache {
    pub fn new(dev_mode: bool, dev_override: bool) -> Self {
        Self {
            dev_mode,
            dev_override,
            entries: DashMap::new(),
        }
    }

    fn disabled(&self) -> bool {
        self.dev_mode && !self.dev_override
    }

    /// `Get(req) → entry|nil`. Misses when disabled, when absent, or when
    /// expired (the expired entry is removed under the shard's write lock).
    pub fn get(&self, key: &str) -> Option<ResponseEntry> {
        if self.disabled() {
            return None;
        }

        let hit = self.entries.get(key).map(|entry| entry.clone());
        match hit {
            Some(entry) if Instant::now() > entry.expires_at => {
                self.entries.remove(key);
                None
            }
            other => other,
        }
    }

    /// `Set(req, ttl, status, headers, body)`. No-op when disabled or
    /// `ttl <= 0`. The header set is cloned before storing.
    pub fn set(&self, key: String, ttl: Duration, status: u16, headers: HeaderMap, body: Bytes) {
        if self.disabled() || ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            ResponseEntry {
                status,
                headers,
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Deletes all expired entries, returning the count removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        HeaderMap::new()
    }

    #[test]
    fn hit_after_miss_returns_identical_body_and_status() {
        let cache = ResponseCache::new(false, false);
        let key = cache_key("GET", "/x", "a=1");
        assert!(cache.get(&key).is_none());

        cache.set(key.clone(), Duration::from_secs(300), 200, headers(), Bytes::from_static(b"B"));
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from_static(b"B"));
    }

    #[test]
    fn different_query_is_a_different_key() {
        let k1 = cache_key("GET", "/x", "a=1");
        let k2 = cache_key("GET", "/x", "a=2");
        assert_ne!(k1, k2);
    }

    #[test]
    fn zero_ttl_is_a_noop() {
        let cache = ResponseCache::new(false, false);
        let key = cache_key("GET", "/x", "");
        cache.set(key.clone(), Duration::ZERO, 200, headers(), Bytes::new());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn dev_mode_disables_unless_overridden() {
        let cache = ResponseCache::new(true, false);
        let key = cache_key("GET", "/x", "");
        cache.set(key.clone(), Duration::from_secs(60), 200, headers(), Bytes::new());
        assert!(cache.get(&key).is_none());

        let overridden = ResponseCache::new(true, true);
        overridden.set(key.clone(), Duration::from_secs(60), 200, headers(), Bytes::new());
        assert!(overridden.get(&key).is_some());
    }

    #[test]
    fn prune_removes_only_expired_entries() {
        let cache = ResponseCache::new(false, false);
        let fresh = cache_key("GET", "/fresh", "");
        let stale = cache_key("GET", "/stale", "");
        cache.set(fresh.clone(), Duration::from_secs(300), 200, headers(), Bytes::new());
        cache.set(stale.clone(), Duration::from_nanos(1), 200, headers(), Bytes::new());

        std::thread::sleep(Duration::from_millis(5));
        let pruned = cache.prune();
        assert_eq!(pruned, 1);
        assert_eq!(cache.size(), 1);
    }
}
