//! Escalating blocks for repeat offenders.
//!
//! A limiter rejection on a strategy that declares a block duration writes a
//! block record; until it expires, requests for that key short-circuit to
//! the blocked response without consulting the limiter at all. Repeated
//! limiter churn from a known-bad actor becomes one explicit cool-down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{CounterStore, StoreError};

use super::key::RateLimitKey;

pub struct BlockManager {
    store: Arc<dyn CounterStore>,
}

impl BlockManager {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Return the block expiry (epoch ms) if `key` is currently blocked.
    ///
    /// A store failure reads as "not blocked": failing open here means the
    /// request falls through to the normal limiter path.
    pub async fn active_block(&self, key: &RateLimitKey, now_ms: i64) -> Option<i64> {
        match self.store.get_block(key, now_ms).await {
            Ok(until) => until,
            Err(e) => {
                warn!(key = %key, error = %e, "block lookup failed, treating as unblocked");
                None
            }
        }
    }

    /// Record a block on `key` for `duration`, starting at `now_ms`.
    pub async fn block(&self, key: &RateLimitKey, duration: Duration, now_ms: i64) -> i64 {
        let until_ms = now_ms + duration.as_millis() as i64;
        match self.store.set_block(key, until_ms).await {
            Ok(()) => {
                debug!(key = %key, until_ms = until_ms, "key blocked");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to record block");
            }
        }
        until_ms
    }

    /// Clear every piece of limiter state for `key`, block included.
    pub async fn reset(&self, key: &RateLimitKey) -> Result<(), StoreError> {
        self.store.reset(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailingStore, MemoryCounterStore};

    fn manager() -> BlockManager {
        BlockManager::new(Arc::new(MemoryCounterStore::new()))
    }

    fn key() -> RateLimitKey {
        RateLimitKey::from_raw("auth:10.0.0.1")
    }

    #[tokio::test]
    async fn test_block_holds_for_full_duration() {
        let manager = manager();
        let key = key();

        let until = manager
            .block(&key, Duration::from_secs(900), 1_000)
            .await;
        assert_eq!(until, 901_000);

        assert_eq!(manager.active_block(&key, 1_000).await, Some(901_000));
        // One millisecond before expiry the block still applies.
        assert_eq!(manager.active_block(&key, 900_999).await, Some(901_000));
        assert_eq!(manager.active_block(&key, 901_000).await, None);
    }

    #[tokio::test]
    async fn test_reset_lifts_block_immediately() {
        let manager = manager();
        let key = key();

        manager.block(&key, Duration::from_secs(900), 1_000).await;
        manager.reset(&key).await.unwrap();
        assert_eq!(manager.active_block(&key, 2_000).await, None);
    }

    #[tokio::test]
    async fn test_store_failure_reads_as_unblocked() {
        let manager = BlockManager::new(Arc::new(FailingStore));
        assert_eq!(manager.active_block(&key(), 1_000).await, None);
        // Failing to write a block must not panic or error out either.
        manager.block(&key(), Duration::from_secs(900), 1_000).await;
    }
}
