//! Token bucket rate limiter.
//!
//! Models a bucket that gains `refill_rate` tokens every `interval` and
//! holds at most `max_burst`. Each attempt drains `cost` tokens. Intended
//! for bursty-but-amortized demand such as AI-backed endpoints, where a
//! short spike is fine but sustained pressure is not.
//!
//! The read-modify-write is two store round trips, not one atomic batch.
//! Under heavy cross-process concurrency a bucket can over-admit slightly;
//! this is an accepted soft-limit trade-off, not a correctness guarantee.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::store::{CounterStore, TokenBucketState};

use super::key::RateLimitKey;
use super::sliding_window::LimitDecision;

/// Tunables for one token bucket.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    /// Bucket capacity; bounds the worst-case spike.
    pub max_burst: f64,
    /// Tokens added per interval.
    pub refill_rate: f64,
    /// Refill cadence.
    pub interval: Duration,
    /// Tokens drained per admitted request.
    pub cost: f64,
}

impl TokenBucketConfig {
    /// Whole tokens the elapsed time has earned.
    fn tokens_to_add(&self, elapsed_ms: i64) -> f64 {
        let interval_ms = self.interval.as_millis() as f64;
        (elapsed_ms as f64 / interval_ms * self.refill_rate).floor()
    }
}

/// Burst-tolerant refillable quota over a [`CounterStore`].
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Evaluate one attempt for `key`.
    ///
    /// Reads the state once, refills, and persists only on admission; a
    /// rejected attempt leaves the stored state untouched. Store failures
    /// on either leg fail open.
    pub async fn check(
        &self,
        key: &RateLimitKey,
        config: &TokenBucketConfig,
        now_ms: i64,
    ) -> LimitDecision {
        let interval_ms = config.interval.as_millis() as i64;
        let limit = config.max_burst as u64;
        // State lives as long as a full refill takes; once that has passed,
        // the refill maths would report a full bucket anyway.
        let ttl_ms =
            interval_ms * (config.max_burst / config.refill_rate).ceil().max(1.0) as i64;

        let state = match self.store.get_bucket(key, now_ms).await {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %key, error = %e, "counter store unavailable, failing open");
                return fail_open(limit, interval_ms, now_ms);
            }
        };

        let (mut tokens, mut last_refill_ms) = match state {
            Some(s) => (s.tokens, s.last_refill_ms),
            // A fresh bucket starts full.
            None => (config.max_burst, now_ms),
        };

        let added = config.tokens_to_add(now_ms - last_refill_ms);
        if added > 0.0 {
            tokens = (tokens + added).min(config.max_burst);
            last_refill_ms = now_ms;
        }

        let allowed = tokens >= config.cost;
        if allowed {
            tokens -= config.cost;
            let persisted = self
                .store
                .put_bucket(
                    key,
                    TokenBucketState {
                        tokens,
                        last_refill_ms,
                    },
                    ttl_ms,
                )
                .await;
            if let Err(e) = persisted {
                warn!(key = %key, error = %e, "failed to persist bucket state");
            }
        }

        trace!(
            key = %key,
            allowed = allowed,
            tokens = tokens,
            "token bucket evaluated"
        );

        LimitDecision {
            allowed,
            limit,
            remaining: tokens.max(0.0) as u64,
            reset_ms: last_refill_ms + interval_ms,
            failed_open: false,
        }
    }
}

fn fail_open(limit: u64, interval_ms: i64, now_ms: i64) -> LimitDecision {
    LimitDecision {
        allowed: true,
        limit,
        remaining: limit.saturating_sub(1),
        reset_ms: now_ms + interval_ms,
        failed_open: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailingStore, MemoryCounterStore};

    fn limiter() -> TokenBucketLimiter {
        TokenBucketLimiter::new(Arc::new(MemoryCounterStore::new()))
    }

    fn key() -> RateLimitKey {
        RateLimitKey::from_raw("chat:user-7")
    }

    fn config() -> TokenBucketConfig {
        // 5-token burst, one token back every 10 seconds.
        TokenBucketConfig {
            max_burst: 5.0,
            refill_rate: 1.0,
            interval: Duration::from_secs(10),
            cost: 1.0,
        }
    }

    #[tokio::test]
    async fn test_burst_then_rejection() {
        let limiter = limiter();
        let (key, cfg) = (key(), config());

        for i in 0..5 {
            let d = limiter.check(&key, &cfg, 1_000).await;
            assert!(d.allowed, "burst request {} should be admitted", i + 1);
        }
        assert!(!limiter.check(&key, &cfg, 1_000).await.allowed);
    }

    #[tokio::test]
    async fn test_refill_grants_exactly_one_token() {
        let limiter = limiter();
        let (key, cfg) = (key(), config());

        for _ in 0..5 {
            limiter.check(&key, &cfg, 0).await;
        }
        assert!(!limiter.check(&key, &cfg, 0).await.allowed);

        // 10 seconds later one token has accrued, and only one.
        assert!(limiter.check(&key, &cfg, 10_000).await.allowed);
        assert!(!limiter.check(&key, &cfg, 10_000).await.allowed);
    }

    #[tokio::test]
    async fn test_partial_interval_earns_nothing() {
        let limiter = limiter();
        let (key, cfg) = (key(), config());

        for _ in 0..5 {
            limiter.check(&key, &cfg, 0).await;
        }
        // 9.9s is short of one full interval at refill_rate 1.
        assert!(!limiter.check(&key, &cfg, 9_900).await.allowed);
    }

    #[tokio::test]
    async fn test_refill_caps_at_max_burst() {
        let limiter = limiter();
        let (key, cfg) = (key(), config());

        limiter.check(&key, &cfg, 0).await;
        // A long idle period refills to capacity, never beyond.
        let d = limiter.check(&key, &cfg, 1_000_000).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
    }

    #[tokio::test]
    async fn test_rejection_does_not_persist_state() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = TokenBucketLimiter::new(store.clone());
        let (key, cfg) = (key(), config());

        for _ in 0..5 {
            limiter.check(&key, &cfg, 0).await;
        }
        let before = store.get_bucket(&key, 0).await.unwrap();
        limiter.check(&key, &cfg, 0).await;
        let after = store.get_bucket(&key, 0).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = TokenBucketLimiter::new(Arc::new(FailingStore));
        let d = limiter.check(&key(), &config(), 1_000).await;
        assert!(d.allowed);
        assert!(d.failed_open);
    }
}
