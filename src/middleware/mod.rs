//! The public entry point: service façade, axum layers, admin routes.

mod admin;
mod facade;
mod layers;

pub use admin::{admin_router, diagnostics_router};
pub use facade::{Gatekeeper, KeyStatus, SharedGatekeeper, Verdict};
pub use layers::{
    bucket_limit, deduplicate, limit, track_metrics, BucketLimitState, DedupState, LimitState,
};
