//! Error types for the gatekeeper throttling layer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for gatekeeper operations.
///
/// A rejected request is a *decision*, not an error: limiter verdicts travel
/// through [`crate::limit::LimitDecision`] and never through this enum. The
/// conditions here are internal, and every one of them is recovered locally
/// by failing open.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store was unreachable or timed out
    #[error("Counter store unavailable: {0}")]
    Store(#[from] StoreError),

    /// A strategy name that no registered strategy matches
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
