//! Aligned sliding-window rate limiter, fail-open on backing-store errors.
//!
//! Grounded in `ProviderRateLimiter` (`llm/batch.rs`), but generalized
//! from a fixed per-provider map to an arbitrary `(key, max, window)`
//! counter behind an injectable `RateLimitStore` trait, and changed from
//! blocking-until-available to report-and-return so the retry envelope
//! owns the backoff decision instead of the limiter itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Backing store abstraction so a future Redis-backed implementation can be
/// swapped in without changing callers. The default `InProcessStore` below
/// is an in-memory `Mutex<HashMap<...>>`, matching `ProviderRateLimiter`'s
/// own in-process state.
pub trait RateLimitStore: Send + Sync {
    /// Atomically increment the counter for `(key, window_start)` and
    /// return the post-increment count. `window_start` is the aligned
    /// window boundary (seconds since epoch, floor-divided by
    /// `window_seconds` then multiplied back).
    fn incr(&self, key: &str, window_start: u64) -> Result<u64, String>;

    fn peek(&self, key: &str, window_start: u64) -> Result<u64, String>;

    fn reset_key(&self, key: &str) -> Result<(), String>;
}

#[derive(Default)]
pub struct InProcessStore {
    counters: Mutex<HashMap<(String, u64), u64>>,
}

impl RateLimitStore for InProcessStore {
    fn incr(&self, key: &str, window_start: u64) -> Result<u64, String> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry((key.to_string(), window_start)).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    fn peek(&self, key: &str, window_start: u64) -> Result<u64, String> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Ok(counters.get(&(key.to_string(), window_start)).copied().unwrap_or(0))
    }

    fn reset_key(&self, key: &str) -> Result<(), String> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.retain(|(k, _), _| k != key);
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn window_start(window_seconds: u64) -> u64 {
    let now = now_secs();
    (now / window_seconds.max(1)) * window_seconds.max(1)
}

/// Sliding-window counter rate limiter, aligned to multiples of
/// `window_seconds`. Trades a brief (at most 2x) burst at window boundaries
/// for implementation simplicity, as specified.
pub struct RateLimiter {
    store: Box<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Box<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn in_process() -> Self {
        Self::new(Box::new(InProcessStore::default()))
    }

    /// Increment the counter for `key` in the current aligned window and
    /// report whether the post-increment count is within `max`. On
    /// backing-store error, fails open (`true`).
    pub fn acquire(&self, key: &str, max: u64, window_seconds: u64) -> bool {
        let ws = window_start(window_seconds);
        match self.store.incr(key, ws) {
            Ok(count) => count <= max,
            Err(reason) => {
                warn!(key, reason, "rate limit store unavailable, failing open");
                true
            }
        }
    }

    /// Remaining budget in the current window, for operability dashboards.
    pub fn get_remaining(&self, key: &str, max: u64, window_seconds: u64) -> u64 {
        let ws = window_start(window_seconds);
        match self.store.peek(key, ws) {
            Ok(used) => max.saturating_sub(used),
            Err(reason) => {
                warn!(key, reason, "rate limit store unavailable on peek, reporting full budget");
                max
            }
        }
    }

    pub fn reset(&self, key: &str) {
        if let Err(reason) = self.store.reset_key(key) {
            warn!(key, reason, "rate limit store unavailable on reset");
        }
    }
}

/// Well-known rate-limit keys used by the gateway.
pub fn model_api_key() -> &'static str {
    "model_api"
}

pub fn global_key() -> &'static str {
    "global"
}

pub fn teacher_key(teacher_id: &str) -> String {
    format!("user:{teacher_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_within_a_window() {
        let limiter = RateLimiter::in_process();
        for _ in 0..3 {
            assert!(limiter.acquire("k", 3, 60));
        }
        assert!(!limiter.acquire("k", 3, 60));
    }

    #[test]
    fn distinct_keys_have_independent_budgets() {
        let limiter = RateLimiter::in_process();
        assert!(limiter.acquire("a", 1, 60));
        assert!(limiter.acquire("b", 1, 60));
        assert!(!limiter.acquire("a", 1, 60));
    }

    #[test]
    fn reset_clears_a_key() {
        let limiter = RateLimiter::in_process();
        assert!(limiter.acquire("k", 1, 60));
        assert!(!limiter.acquire("k", 1, 60));
        limiter.reset("k");
        assert!(limiter.acquire("k", 1, 60));
    }

    #[test]
    fn failing_store_fails_open() {
        struct BrokenStore;
        impl RateLimitStore for BrokenStore {
            fn incr(&self, _key: &str, _window_start: u64) -> Result<u64, String> {
                Err("backend down".into())
            }
            fn peek(&self, _key: &str, _window_start: u64) -> Result<u64, String> {
                Err("backend down".into())
            }
            fn reset_key(&self, _key: &str) -> Result<(), String> {
                Err("backend down".into())
            }
        }
        let limiter = RateLimiter::new(Box::new(BrokenStore));
        assert!(limiter.acquire("k", 0, 60));
        assert_eq!(limiter.get_remaining("k", 5, 60), 5);
    }
}
