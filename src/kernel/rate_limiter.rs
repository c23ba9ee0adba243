//! Rate limiting and throttling.
//!
//! Token bucket per sender. A bucket holds at most `max_tokens` and refills
//! completely over `refill_interval`, proportionally to elapsed time. Each
//! admitted message withdraws one token.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{Error, Result};

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size and bucket ceiling.
    pub max_tokens: u32,
    /// Time for an empty bucket to refill completely.
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    /// Buckets untouched for this long are dropped by cleanup.
    #[serde(with = "humantime_serde")]
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_interval: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(600),
        }
    }
}

/// One sender's bucket. Parameters are fixed when the bucket is created.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_secs: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let max_tokens = f64::from(config.max_tokens);
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_secs: config.refill_interval.as_secs_f64(),
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            // Multiply before dividing so whole-token steps stay exact.
            let added = elapsed * self.max_tokens / self.refill_secs;
            self.tokens = (self.tokens + added).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) * self.refill_secs / self.max_tokens;
            Err(Duration::from_secs_f64(wait.max(0.0)))
        }
    }
}

/// Rate limiter - enforces per-sender admission.
///
/// Buckets live in a sharded map, so checks for different senders proceed
/// in parallel and checks for one sender are serialized.
#[derive(Debug)]
pub struct RateLimiter {
    config: ArcSwap<RateLimitConfig>,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: ArcSwap::new(Arc::new(config)),
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    /// New parameters apply to buckets created from now on.
    pub fn update_config(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
    }

    /// Admit one message from `sender`, or fail with `RateLimited`.
    pub fn check(&self, sender: &str) -> Result<()> {
        self.check_at(sender, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(&self, sender: &str, now: Instant) -> Result<()> {
        let mut bucket = self
            .buckets
            .entry(sender.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config.load(), now));

        bucket.try_take(now).map_err(|retry_after| {
            tracing::debug!(sender, ?retry_after, "rate_limited");
            Error::rate_limited(format!("{sender} exceeded rate limit, retry in {retry_after:?}"))
        })
    }

    /// Whole tokens `sender` could spend right now.
    pub fn remaining(&self, sender: &str) -> u32 {
        self.remaining_at(sender, Instant::now())
    }

    pub fn remaining_at(&self, sender: &str, now: Instant) -> u32 {
        match self.buckets.get_mut(sender) {
            Some(mut bucket) => {
                bucket.refill(now);
                bucket.tokens.floor() as u32
            }
            None => self.config.load().max_tokens,
        }
    }

    /// Forget `sender`'s bucket. Its next message starts from full.
    pub fn clear(&self, sender: &str) {
        self.buckets.remove(sender);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets not used within `idle`. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.evict_idle_at(idle, Instant::now())
    }

    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < idle);
        before.saturating_sub(self.buckets.len())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_per_minute() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_tokens: 10,
            refill_interval: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(600),
        })
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = ten_per_minute();
        let t0 = Instant::now();

        for _ in 0..10 {
            limiter.check_at("alice", t0).unwrap();
        }
        let err = limiter.check_at("alice", t0).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");

        // 6s refills exactly one token.
        let t1 = t0 + Duration::from_secs(6);
        limiter.check_at("alice", t1).unwrap();
        assert!(limiter.check_at("alice", t1).is_err());
    }

    #[test]
    fn test_senders_are_independent() {
        let limiter = ten_per_minute();
        let t0 = Instant::now();
        for _ in 0..10 {
            limiter.check_at("alice", t0).unwrap();
        }
        assert!(limiter.check_at("alice", t0).is_err());
        assert!(limiter.check_at("bob", t0).is_ok());
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_refill_is_capped() {
        let limiter = ten_per_minute();
        let t0 = Instant::now();
        limiter.check_at("alice", t0).unwrap();

        let later = t0 + Duration::from_secs(3600);
        assert_eq!(limiter.remaining_at("alice", later), 10);
    }

    #[test]
    fn test_remaining_and_clear() {
        let limiter = ten_per_minute();
        assert_eq!(limiter.remaining("nobody"), 10);

        let t0 = Instant::now();
        for _ in 0..3 {
            limiter.check_at("alice", t0).unwrap();
        }
        assert_eq!(limiter.remaining_at("alice", t0), 7);

        limiter.clear("alice");
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_evict_idle() {
        let limiter = ten_per_minute();
        let t0 = Instant::now();
        limiter.check_at("old", t0).unwrap();
        limiter.check_at("new", t0 + Duration::from_secs(500)).unwrap();

        let evicted = limiter.evict_idle_at(Duration::from_secs(300), t0 + Duration::from_secs(600));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.remaining_at("new", t0 + Duration::from_secs(600)), 10);
    }

    #[test]
    fn test_updated_config_applies_to_new_buckets() {
        let limiter = ten_per_minute();
        let t0 = Instant::now();
        limiter.check_at("alice", t0).unwrap();

        limiter.update_config(RateLimitConfig {
            max_tokens: 2,
            ..RateLimitConfig::default()
        });
        limiter.check_at("bob", t0).unwrap();
        limiter.check_at("bob", t0).unwrap();
        assert!(limiter.check_at("bob", t0).is_err());
        assert_eq!(limiter.remaining_at("alice", t0), 9);
    }
}
