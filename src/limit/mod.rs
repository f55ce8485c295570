//! Rate limiting logic: keys, strategies, limiters, blocks.

mod adaptive;
mod block;
mod key;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use adaptive::{AdaptiveController, FixedLoadSampler, LoadSampler, ProcessLoadSampler};
pub use block::BlockManager;
pub use key::{RateLimitKey, RequestIdentity};
pub use sliding_window::{LimitDecision, SlidingWindowLimiter};
pub use strategy::{
    KeySource, LimitOverrides, StrategyDefinition, StrategyId, StrategyRegistry,
};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter};
