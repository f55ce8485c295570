//! In-process counter store.
//!
//! Every trait method runs inside one `parking_lot` critical section, which
//! gives the same atomicity the pipelined batches of an external store would:
//! no interleaving between prune, count, insert, and TTL refresh.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::limit::RateLimitKey;

use super::{CounterStore, StoreError, TokenBucketState, WindowAdmission};

/// One admitted request inside a window set.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp_ms: i64,
    #[allow(dead_code)]
    nonce: Uuid,
}

#[derive(Debug, Default)]
struct WindowSet {
    entries: Vec<WindowEntry>,
    expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct BucketSlot {
    state: TokenBucketState,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Inner {
    windows: HashMap<String, WindowSet>,
    buckets: HashMap<String, BucketSlot>,
    blocks: HashMap<String, i64>,
}

/// Counter store backed by process memory.
///
/// Suitable for single-process deployments and for tests. Multi-process
/// deployments substitute a shared store behind the same trait.
#[derive(Default)]
pub struct MemoryCounterStore {
    inner: Mutex<Inner>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding any state.
    pub fn key_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.windows.len() + inner.buckets.len() + inner.blocks.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn window_admit(
        &self,
        key: &RateLimitKey,
        window_ms: i64,
        limit: u64,
        now_ms: i64,
        nonce: Uuid,
    ) -> Result<WindowAdmission, StoreError> {
        let mut inner = self.inner.lock();
        let set = inner.windows.entry(key.as_str().to_string()).or_default();

        let cutoff = now_ms - window_ms;
        set.entries.retain(|e| e.timestamp_ms > cutoff);

        let count = set.entries.len() as u64;
        let allowed = count < limit;
        if allowed {
            set.entries.push(WindowEntry {
                timestamp_ms: now_ms,
                nonce,
            });
            set.expires_at_ms = now_ms + window_ms;
        }

        let oldest_ms = set.entries.iter().map(|e| e.timestamp_ms).min();
        if set.entries.is_empty() {
            inner.windows.remove(key.as_str());
        }

        Ok(WindowAdmission {
            allowed,
            count,
            oldest_ms,
        })
    }

    async fn window_count(
        &self,
        key: &RateLimitKey,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        let cutoff = now_ms - window_ms;
        let count = inner
            .windows
            .get(key.as_str())
            .map(|set| {
                set.entries
                    .iter()
                    .filter(|e| e.timestamp_ms > cutoff)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(count)
    }

    async fn get_bucket(
        &self,
        key: &RateLimitKey,
        now_ms: i64,
    ) -> Result<Option<TokenBucketState>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .buckets
            .get(key.as_str())
            .filter(|slot| slot.expires_at_ms > now_ms)
            .map(|slot| slot.state))
    }

    async fn put_bucket(
        &self,
        key: &RateLimitKey,
        state: TokenBucketState,
        ttl_ms: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.buckets.insert(
            key.as_str().to_string(),
            BucketSlot {
                state,
                expires_at_ms: state.last_refill_ms + ttl_ms,
            },
        );
        Ok(())
    }

    async fn set_block(&self, key: &RateLimitKey, until_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.blocks.insert(key.as_str().to_string(), until_ms);
        Ok(())
    }

    async fn get_block(
        &self,
        key: &RateLimitKey,
        now_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock();
        match inner.blocks.get(key.as_str()).copied() {
            Some(until) if until > now_ms => Ok(Some(until)),
            Some(_) => {
                inner.blocks.remove(key.as_str());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.windows.remove(key.as_str());
        inner.buckets.remove(key.as_str());
        inner.blocks.remove(key.as_str());
        Ok(())
    }

    async fn cleanup(&self, now_ms: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let before =
            inner.windows.len() + inner.buckets.len() + inner.blocks.len();
        inner.windows.retain(|_, set| set.expires_at_ms > now_ms);
        inner.buckets.retain(|_, slot| slot.expires_at_ms > now_ms);
        inner.blocks.retain(|_, until| *until > now_ms);
        let after = inner.windows.len() + inner.buckets.len() + inner.blocks.len();
        Ok((before - after) as u64)
    }
}

/// Store double that fails every call, for fail-open tests.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for FailingStore {
    async fn window_admit(
        &self,
        _key: &RateLimitKey,
        _window_ms: i64,
        _limit: u64,
        _now_ms: i64,
        _nonce: Uuid,
    ) -> Result<WindowAdmission, StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn window_count(
        &self,
        _key: &RateLimitKey,
        _window_ms: i64,
        _now_ms: i64,
    ) -> Result<u64, StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn get_bucket(
        &self,
        _key: &RateLimitKey,
        _now_ms: i64,
    ) -> Result<Option<TokenBucketState>, StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn put_bucket(
        &self,
        _key: &RateLimitKey,
        _state: TokenBucketState,
        _ttl_ms: i64,
    ) -> Result<(), StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn set_block(&self, _key: &RateLimitKey, _until_ms: i64) -> Result<(), StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn get_block(
        &self,
        _key: &RateLimitKey,
        _now_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        Err(StoreError::Timeout(250))
    }

    async fn reset(&self, _key: &RateLimitKey) -> Result<(), StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }

    async fn cleanup(&self, _now_ms: i64) -> Result<u64, StoreError> {
        Err(StoreError::Transport("connection refused".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RateLimitKey {
        RateLimitKey::from_raw(s)
    }

    #[tokio::test]
    async fn test_window_admit_under_limit() {
        let store = MemoryCounterStore::new();
        let k = key("general:1.2.3.4");

        let adm = store
            .window_admit(&k, 60_000, 3, 1_000, Uuid::new_v4())
            .await
            .unwrap();
        assert!(adm.allowed);
        assert_eq!(adm.count, 0);
        assert_eq!(adm.oldest_ms, Some(1_000));
    }

    #[tokio::test]
    async fn test_window_admit_rejects_at_limit() {
        let store = MemoryCounterStore::new();
        let k = key("general:1.2.3.4");

        for i in 0..3 {
            let adm = store
                .window_admit(&k, 60_000, 3, 1_000 + i, Uuid::new_v4())
                .await
                .unwrap();
            assert!(adm.allowed);
        }

        let adm = store
            .window_admit(&k, 60_000, 3, 1_010, Uuid::new_v4())
            .await
            .unwrap();
        assert!(!adm.allowed);
        assert_eq!(adm.count, 3);
        // A rejected request inserts nothing.
        assert_eq!(store.window_count(&k, 60_000, 1_010).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_window_admit_prunes_expired_entries() {
        let store = MemoryCounterStore::new();
        let k = key("general:1.2.3.4");

        store
            .window_admit(&k, 60_000, 3, 0, Uuid::new_v4())
            .await
            .unwrap();

        // 61 seconds later the first entry has aged out.
        let adm = store
            .window_admit(&k, 60_000, 3, 61_000, Uuid::new_v4())
            .await
            .unwrap();
        assert!(adm.allowed);
        assert_eq!(adm.count, 0);
        assert_eq!(adm.oldest_ms, Some(61_000));
    }

    #[tokio::test]
    async fn test_bucket_roundtrip_and_ttl() {
        let store = MemoryCounterStore::new();
        let k = key("chat:42");

        let state = TokenBucketState {
            tokens: 4.0,
            last_refill_ms: 1_000,
        };
        store.put_bucket(&k, state, 10_000).await.unwrap();

        assert_eq!(store.get_bucket(&k, 5_000).await.unwrap(), Some(state));
        // Past the TTL the state is gone.
        assert_eq!(store.get_bucket(&k, 12_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_block_expires_and_is_removed() {
        let store = MemoryCounterStore::new();
        let k = key("auth:9.9.9.9");

        store.set_block(&k, 900_000).await.unwrap();
        assert_eq!(store.get_block(&k, 10_000).await.unwrap(), Some(900_000));
        assert_eq!(store.get_block(&k, 900_001).await.unwrap(), None);
        // Expired record is dropped eagerly.
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_all_state_for_key() {
        let store = MemoryCounterStore::new();
        let k = key("auth:9.9.9.9");

        store
            .window_admit(&k, 60_000, 5, 1_000, Uuid::new_v4())
            .await
            .unwrap();
        store.set_block(&k, 900_000).await.unwrap();

        store.reset(&k).await.unwrap();
        assert_eq!(store.window_count(&k, 60_000, 1_000).await.unwrap(), 0);
        assert_eq!(store.get_block(&k, 1_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_keys_only() {
        let store = MemoryCounterStore::new();
        let fresh = key("general:fresh");
        let stale = key("general:stale");

        store
            .window_admit(&stale, 1_000, 5, 0, Uuid::new_v4())
            .await
            .unwrap();
        store
            .window_admit(&fresh, 60_000, 5, 5_000, Uuid::new_v4())
            .await
            .unwrap();

        let removed = store.cleanup(10_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.key_count(), 1);
    }
}
