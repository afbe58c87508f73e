//! Token-bucket rate limiting per identity.
//!
//! Buckets refill continuously at the configured per-minute rate and
//! allow bursts up to capacity. The identity map is hard-capped so IP
//! spoofing cannot grow memory without bound; when the cap is hit,
//! stale buckets are reclaimed first and new identities are rejected if
//! the table is still full.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Hard cap on tracked identities.
const MAX_TRACKED_IDENTITIES: usize = 10_000;

/// Reclaim buckets idle longer than this many seconds.
const STALE_AFTER_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limited; retry after {retry_after_secs}s")]
pub struct RateLimited {
    pub retry_after_secs: u64,
}

/// One identity's bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, per_minute: f64) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_minute / 60.0).min(capacity);
        self.last_refill = Instant::now();
    }

    fn try_consume(&mut self, capacity: f64, per_minute: f64) -> Result<(), RateLimited> {
        self.refill(capacity, per_minute);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let secs = (deficit * 60.0 / per_minute).ceil().max(1.0);
            Err(RateLimited {
                retry_after_secs: secs as u64,
            })
        }
    }
}

/// Per-identity token-bucket limiter.
pub struct RateLimiter {
    capacity: f64,
    per_minute: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// `per_minute` is both refill rate and bucket capacity, matching
    /// an "N requests per minute" contract with burst up to N.
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            capacity: per_minute as f64,
            per_minute: per_minute as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check and consume one request for an identity key.
    pub fn check(&self, key: &str) -> Result<(), RateLimited> {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        if !buckets.contains_key(key) && buckets.len() >= MAX_TRACKED_IDENTITIES {
            buckets.retain(|_, b| b.last_refill.elapsed().as_secs_f64() < STALE_AFTER_SECS);
            if buckets.len() >= MAX_TRACKED_IDENTITIES {
                return Err(RateLimited {
                    retry_after_secs: 60,
                });
            }
        }

        let capacity = self.capacity;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(capacity));
        bucket.try_consume(self.capacity, self.per_minute)
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::per_minute(60);
        for _ in 0..60 {
            limiter.check("sub:alice").unwrap();
        }
        // The 61st request in the same minute is rejected with a hint.
        let err = limiter.check("sub:alice").unwrap_err();
        assert!(err.retry_after_secs >= 1);
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = RateLimiter::per_minute(2);
        limiter.check("sub:a").unwrap();
        limiter.check("sub:a").unwrap();
        assert!(limiter.check("sub:a").is_err());
        limiter.check("sub:b").unwrap();
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::per_minute(60_000); // 1000/sec for a fast test
        for _ in 0..60_000 {
            let _ = limiter.check("k");
        }
        assert!(limiter.check("k").is_err());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.check("k").is_ok());
    }

    #[test]
    fn test_tracked_count() {
        let limiter = RateLimiter::per_minute(10);
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        assert_eq!(limiter.tracked(), 2);
    }
}
