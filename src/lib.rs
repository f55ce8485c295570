//! Gatekeeper - Request Throttling and Coalescing Middleware
//!
//! This crate implements the protection layer that sits between an HTTP
//! framework and its business controllers: sliding-window and token-bucket
//! rate limiting, escalating blocks for repeat offenders, adaptive
//! load-responsive limits, single-flight deduplication of identical
//! concurrent requests, and per-endpoint request metrics.
//!
//! The layer is deliberately fail-open: when its own counter store is
//! unavailable, requests are allowed through with a warning. Availability
//! outranks strict enforcement.

pub mod config;
pub mod dedup;
pub mod error;
pub mod limit;
pub mod metrics;
pub mod middleware;
pub mod store;
