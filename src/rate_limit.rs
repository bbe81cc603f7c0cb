//! RateLimiter (spec.md §4.5): per-key token-bucket allow/deny over a
//! sliding window, resolved to `user:<id>` or `ip:<remote>`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorLimiter};

type KeyedLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Resolves the limiter key the way spec.md §4.5 specifies: an
/// authenticated user wins over the remote address.
pub fn resolve_key(user_id: Option<&str>, remote_addr: &str) -> String {
    match user_id {
        Some(id) => format!("user:{id}"),
        None => format!("ip:{remote_addr}"),
    }
}

/// One `governor` limiter per key, created lazily on first use with the
/// `(limit, window)` the caller supplies — callers may pass a different
/// quota per call (route defaults vs. a script's own `rateLimit` export),
/// so the quota is not fixed at construction time the way the framework
/// lineage's own rate-limit middleware configures it up front.
pub struct RateLimiter {
    limiters: DashMap<String, Arc<KeyedLimiter>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// `Allow(key, limit, window) → bool`.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        let limit = NonZeroU32::new(limit.max(1)).unwrap();
        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(GovernorLimiter::direct(Quota::with_period(window).unwrap().allow_burst(limit))))
            .clone();
        limiter.check().is_ok()
    }

    pub fn clear(&self) {
        self.limiters.clear();
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_allowed_second_denied() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("ip:1.2.3.4", 1, Duration::from_secs(1)));
        assert!(!limiter.allow("ip:1.2.3.4", 1, Duration::from_secs(1)));
    }

    #[test]
    fn distinct_keys_have_independent_budgets() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("ip:1.2.3.4", 1, Duration::from_secs(60)));
        assert!(limiter.allow("ip:5.6.7.8", 1, Duration::from_secs(60)));
    }

    #[test]
    fn authenticated_user_key_wins_over_ip() {
        assert_eq!(resolve_key(Some("42"), "1.2.3.4"), "user:42");
        assert_eq!(resolve_key(None, "1.2.3.4"), "ip:1.2.3.4");
    }
}
