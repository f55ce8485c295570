//! The gatekeeper service object.
//!
//! One explicit service constructed at the application's composition root
//! and shared behind an `Arc`. There are no module-level singletons; every
//! piece of limiter and metrics state lives inside this struct.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GatekeeperConfig;
use crate::dedup::DeduplicationCoordinator;
use crate::error::Result;
use crate::limit::{
    AdaptiveController, BlockManager, LimitOverrides, LoadSampler, ProcessLoadSampler,
    RateLimitKey, RequestIdentity, SlidingWindowLimiter, StrategyId, StrategyRegistry,
    TokenBucketConfig, TokenBucketLimiter,
};
use crate::metrics::MetricsAggregator;
use crate::store::{CounterStore, MemoryCounterStore, StoreError};

/// Shared handle to the gatekeeper service.
pub type SharedGatekeeper = Arc<Gatekeeper>;

/// The throttling layer's verdict on one request.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Admitted; metadata feeds the `X-RateLimit-*` headers.
    Allow {
        limit: u64,
        remaining: u64,
        reset_ms: i64,
    },
    /// Over the limit; retry metadata feeds the 429 body.
    Deny {
        limit: u64,
        reset_ms: i64,
        message: String,
    },
    /// Under an escalated block; the block expiry doubles as `reset`.
    Block { until_ms: i64, message: String },
}

/// Answer to an administrative status query.
#[derive(Debug, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub count: u64,
    pub remaining: u64,
    pub blocked_until: Option<i64>,
}

/// Request throttling and coalescing service.
pub struct Gatekeeper {
    registry: StrategyRegistry,
    store: Arc<dyn CounterStore>,
    window: SlidingWindowLimiter,
    bucket: TokenBucketLimiter,
    blocks: BlockManager,
    adaptive: Option<AdaptiveController>,
    dedup: DeduplicationCoordinator,
    metrics: MetricsAggregator,
    dedup_max_body: usize,
    janitor_interval: Duration,
}

impl Gatekeeper {
    /// Build with the in-process counter store.
    pub fn new(config: &GatekeeperConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryCounterStore::new()))
    }

    /// Build against an externally provided counter store.
    pub fn with_store(config: &GatekeeperConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let registry = StrategyRegistry::with_definitions(config.strategy_definitions()?)?;

        let adaptive = if config.throttle.adaptive.enabled {
            let sampler = Arc::new(ProcessLoadSampler::new(
                config.throttle.adaptive.memory_budget_mb * 1024 * 1024,
            ));
            Some(AdaptiveController::new(
                sampler,
                config.throttle.adaptive.min_limit,
            ))
        } else {
            None
        };

        info!(
            adaptive = adaptive.is_some(),
            janitor_interval_secs = config.throttle.janitor_interval_secs,
            "gatekeeper initialized"
        );

        Ok(Self {
            registry,
            window: SlidingWindowLimiter::new(store.clone()),
            bucket: TokenBucketLimiter::new(store.clone()),
            blocks: BlockManager::new(store.clone()),
            store,
            adaptive,
            dedup: DeduplicationCoordinator::new(Duration::from_secs(
                config.dedup.wait_timeout_secs,
            )),
            metrics: MetricsAggregator::new(config.metrics.to_metrics_config()),
            dedup_max_body: config.dedup.max_body_bytes,
            janitor_interval: Duration::from_secs(config.throttle.janitor_interval_secs),
        })
    }

    /// Swap the adaptive load sampler. Only meaningful when the adaptive
    /// controller is enabled; used by hosts with their own load signal and
    /// by tests.
    pub fn with_load_sampler(mut self, sampler: Arc<dyn LoadSampler>, min_limit: u64) -> Self {
        if self.adaptive.is_some() {
            self.adaptive = Some(AdaptiveController::new(sampler, min_limit));
        }
        self
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    pub fn dedup(&self) -> &DeduplicationCoordinator {
        &self.dedup
    }

    pub fn dedup_max_body(&self) -> usize {
        self.dedup_max_body
    }

    /// Evaluate one request against a sliding-window strategy.
    ///
    /// Order matters: an active block short-circuits before the limiter is
    /// consulted, and a rejection on a blocking strategy escalates into a
    /// fresh block whose expiry is returned as the verdict's reset.
    pub async fn evaluate(
        &self,
        strategy: StrategyId,
        overrides: &LimitOverrides,
        identity: &RequestIdentity,
        now_ms: i64,
    ) -> Verdict {
        let definition = self.registry.get(strategy).with_overrides(overrides);
        let key = definition.key_for(identity);

        if let Some(until_ms) = self.blocks.active_block(&key, now_ms).await {
            debug!(key = %key, until_ms = until_ms, "request short-circuited by block");
            return Verdict::Block {
                until_ms,
                message: definition.message.clone(),
            };
        }

        let limit_points = match &self.adaptive {
            Some(controller) => controller.effective_limit(definition.limit_points),
            None => definition.limit_points,
        };

        let decision = self
            .window
            .check(&key, limit_points, definition.window, now_ms)
            .await;

        if decision.allowed {
            return Verdict::Allow {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_ms: decision.reset_ms,
            };
        }

        if let Some(block_duration) = definition.block_duration {
            let until_ms = self.blocks.block(&key, block_duration, now_ms).await;
            return Verdict::Block {
                until_ms,
                message: definition.message.clone(),
            };
        }

        Verdict::Deny {
            limit: decision.limit,
            reset_ms: decision.reset_ms,
            message: definition.message.clone(),
        }
    }

    /// Evaluate one request against a token bucket keyed by a strategy.
    pub async fn evaluate_bucket(
        &self,
        strategy: StrategyId,
        bucket: &TokenBucketConfig,
        identity: &RequestIdentity,
        now_ms: i64,
    ) -> Verdict {
        let definition = self.registry.get(strategy);
        let key = definition.key_for(identity);

        if let Some(until_ms) = self.blocks.active_block(&key, now_ms).await {
            return Verdict::Block {
                until_ms,
                message: definition.message.clone(),
            };
        }

        let decision = self.bucket.check(&key, bucket, now_ms).await;

        if decision.allowed {
            Verdict::Allow {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_ms: decision.reset_ms,
            }
        } else if let Some(block_duration) = definition.block_duration {
            let until_ms = self.blocks.block(&key, block_duration, now_ms).await;
            Verdict::Block {
                until_ms,
                message: definition.message.clone(),
            }
        } else {
            Verdict::Deny {
                limit: decision.limit,
                reset_ms: decision.reset_ms,
                message: definition.message.clone(),
            }
        }
    }

    /// Clear all limiter state for a key, lifting any block.
    pub async fn reset(&self, key: &RateLimitKey) -> std::result::Result<(), StoreError> {
        self.blocks.reset(key).await
    }

    /// Current window occupancy for a key against the given limits.
    pub async fn status(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
        now_ms: i64,
    ) -> std::result::Result<KeyStatus, StoreError> {
        let count = self
            .store
            .window_count(key, window.as_millis() as i64, now_ms)
            .await?;
        let blocked_until = self.store.get_block(key, now_ms).await?;
        Ok(KeyStatus {
            key: key.to_string(),
            count,
            remaining: limit.saturating_sub(count),
            blocked_until,
        })
    }

    /// Drop every expired entry across all keys.
    pub async fn cleanup(&self, now_ms: i64) -> std::result::Result<u64, StoreError> {
        self.store.cleanup(now_ms).await
    }

    /// Start the periodic maintenance task. Cleanup runs on a fixed
    /// schedule independent of request volume.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gatekeeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gatekeeper.janitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now_ms = Utc::now().timestamp_millis();
                match gatekeeper.store.cleanup(now_ms).await {
                    Ok(removed) if removed > 0 => {
                        debug!(removed = removed, "janitor removed expired keys");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "janitor cleanup failed"),
                }
                gatekeeper.metrics.prune(now_ms);
            }
        })
    }
}
