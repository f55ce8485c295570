//! Sliding window rate limiter.
//!
//! Counts requests in a continuously moving trailing interval, so there is
//! no fixed-bucket boundary burst: a key limited to N per minute can never
//! see more than N admissions in *any* 60 second span. Costs O(window size)
//! storage per key, paid for exact semantics.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};
use uuid::Uuid;

use crate::store::CounterStore;

use super::key::RateLimitKey;

/// Verdict of a limiter evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitDecision {
    pub allowed: bool,
    /// The limit that applied to this evaluation.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Epoch milliseconds at which the window frees a slot.
    pub reset_ms: i64,
    /// True when the store failed and the request was admitted by policy.
    pub failed_open: bool,
}

impl LimitDecision {
    /// Fail-open verdict: full limit advertised, reset one window away.
    fn open(limit: u64, window_ms: i64, now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(1),
            reset_ms: now_ms + window_ms,
            failed_open: true,
        }
    }
}

/// Trailing-window request counter over a [`CounterStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Evaluate one attempt for `key`.
    ///
    /// Issues a single store batch (prune, count, conditional insert, TTL).
    /// A store failure admits the request and logs a warning; the protection
    /// layer must never be the thing that takes the service down.
    pub async fn check(
        &self,
        key: &RateLimitKey,
        limit_points: u64,
        window: Duration,
        now_ms: i64,
    ) -> LimitDecision {
        let window_ms = window.as_millis() as i64;
        let nonce = Uuid::new_v4();

        let admission = match self
            .store
            .window_admit(key, window_ms, limit_points, now_ms, nonce)
            .await
        {
            Ok(adm) => adm,
            Err(e) => {
                warn!(key = %key, error = %e, "counter store unavailable, failing open");
                return LimitDecision::open(limit_points, window_ms, now_ms);
            }
        };

        let reset_ms = admission
            .oldest_ms
            .map(|oldest| oldest + window_ms)
            .unwrap_or(now_ms + window_ms);

        let remaining = if admission.allowed {
            // The count predates this request's own entry; subtract it too.
            limit_points
                .saturating_sub(admission.count)
                .saturating_sub(1)
        } else {
            0
        };

        trace!(
            key = %key,
            allowed = admission.allowed,
            count = admission.count,
            remaining = remaining,
            "sliding window evaluated"
        );

        LimitDecision {
            allowed: admission.allowed,
            limit: limit_points,
            remaining,
            reset_ms,
            failed_open: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailingStore, MemoryCounterStore};

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemoryCounterStore::new()))
    }

    fn key() -> RateLimitKey {
        RateLimitKey::from_raw("general:10.0.0.1")
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_first_n_allowed_then_rejected() {
        let limiter = limiter();
        let key = key();

        for i in 0..5 {
            let d = limiter.check(&key, 5, MINUTE, 1_000 + i).await;
            assert!(d.allowed, "request {} should be admitted", i + 1);
        }
        let d = limiter.check(&key, 5, MINUTE, 1_010).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn test_sliding_not_fixed_window_semantics() {
        let limiter = limiter();
        let key = key();

        // limit=3 per 60s: t=0,1,2 allowed, t=3 rejected, t=61 allowed again.
        assert!(limiter.check(&key, 3, MINUTE, 0).await.allowed);
        assert!(limiter.check(&key, 3, MINUTE, 1_000).await.allowed);
        assert!(limiter.check(&key, 3, MINUTE, 2_000).await.allowed);
        assert!(!limiter.check(&key, 3, MINUTE, 3_000).await.allowed);
        // At t=61s the t=0 entry has slid out of the window.
        assert!(limiter.check(&key, 3, MINUTE, 61_000).await.allowed);
    }

    #[tokio::test]
    async fn test_remaining_counts_down_to_zero_on_last_slot() {
        let limiter = limiter();
        let key = key();

        let d = limiter.check(&key, 3, MINUTE, 0).await;
        assert_eq!(d.remaining, 2);
        let d = limiter.check(&key, 3, MINUTE, 1).await;
        assert_eq!(d.remaining, 1);
        // Last admissible request reports zero remaining.
        let d = limiter.check(&key, 3, MINUTE, 2).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_is_oldest_entry_plus_window() {
        let limiter = limiter();
        let key = key();

        limiter.check(&key, 3, MINUTE, 5_000).await;
        let d = limiter.check(&key, 3, MINUTE, 20_000).await;
        assert_eq!(d.reset_ms, 5_000 + 60_000);
    }

    #[tokio::test]
    async fn test_reset_for_empty_window_is_now_plus_window() {
        let limiter = limiter();
        let d = limiter.check(&key(), 3, MINUTE, 7_000).await;
        // The inserted entry is its own oldest.
        assert_eq!(d.reset_ms, 7_000 + 60_000);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = SlidingWindowLimiter::new(Arc::new(FailingStore));
        let d = limiter.check(&key(), 5, MINUTE, 1_000).await;
        assert!(d.allowed);
        assert!(d.failed_open);
        assert_eq!(d.limit, 5);
        assert_eq!(d.remaining, 4);
    }
}
