//! Counter store abstraction.
//!
//! The counter store is the only state shared across processes. Every
//! operation on it is a single atomic batch; callers never read state in one
//! round trip and write it back in another, with the deliberate exception of
//! the token bucket (see [`crate::limit::token_bucket`] for the trade-off).
//!
//! Implementations must treat transport failures as [`StoreError`] so that
//! callers can fail open. There is no local fallback counting here: a
//! per-process fallback would diverge across processes and silently loosen
//! the limits.

mod memory;

pub use memory::MemoryCounterStore;

#[cfg(test)]
pub(crate) use memory::FailingStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::limit::RateLimitKey;

/// Errors surfaced by a counter store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store transport error: {0}")]
    Transport(String),

    /// The store did not answer within the retry budget.
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),
}

/// Outcome of a sliding-window admission batch.
#[derive(Debug, Clone, Copy)]
pub struct WindowAdmission {
    /// Whether the entry was inserted (the request admitted).
    pub allowed: bool,
    /// Entries present in the window before this request.
    pub count: u64,
    /// Timestamp of the oldest surviving entry after the batch, if any.
    pub oldest_ms: Option<i64>,
}

/// Persisted token bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    /// Currently available tokens.
    pub tokens: f64,
    /// When tokens were last added.
    pub last_refill_ms: i64,
}

/// Atomic access to shared, TTL-bound counters and sets.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Sliding-window admission as one pipelined batch:
    /// prune entries older than `now_ms - window_ms`, count the survivors,
    /// insert `(now_ms, nonce)` if the count is below `limit`, and refresh
    /// the key's TTL to `window_ms`.
    async fn window_admit(
        &self,
        key: &RateLimitKey,
        window_ms: i64,
        limit: u64,
        now_ms: i64,
        nonce: Uuid,
    ) -> Result<WindowAdmission, StoreError>;

    /// Count window entries newer than `now_ms - window_ms` without
    /// inserting anything. Used by status queries.
    async fn window_count(
        &self,
        key: &RateLimitKey,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<u64, StoreError>;

    /// Read the token bucket state for a key, if present and unexpired.
    async fn get_bucket(
        &self,
        key: &RateLimitKey,
        now_ms: i64,
    ) -> Result<Option<TokenBucketState>, StoreError>;

    /// Persist token bucket state with the given TTL.
    async fn put_bucket(
        &self,
        key: &RateLimitKey,
        state: TokenBucketState,
        ttl_ms: i64,
    ) -> Result<(), StoreError>;

    /// Record a block on `key` until `until_ms`.
    async fn set_block(&self, key: &RateLimitKey, until_ms: i64) -> Result<(), StoreError>;

    /// Return the active block expiry for `key`, if one exists at `now_ms`.
    async fn get_block(
        &self,
        key: &RateLimitKey,
        now_ms: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Remove all state held for `key`: window entries, bucket, block.
    async fn reset(&self, key: &RateLimitKey) -> Result<(), StoreError>;

    /// Drop every expired entry across all keys. Returns the number of keys
    /// removed. Driven by the periodic janitor task, never by request volume.
    async fn cleanup(&self, now_ms: i64) -> Result<u64, StoreError>;
}
