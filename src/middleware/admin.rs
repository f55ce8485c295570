//! Administrative and diagnostic HTTP surfaces.
//!
//! Mounted by the host application, typically behind its own operator
//! authentication. Admin routes mutate limiter state for one key;
//! diagnostics routes are read-only views over the metrics aggregator.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::limit::RateLimitKey;
use crate::metrics::HealthState;

use super::facade::SharedGatekeeper;

/// `/reset/{key}`, `/status/{key}`, `/cleanup`.
pub fn admin_router(gatekeeper: SharedGatekeeper) -> Router {
    Router::new()
        .route("/reset/:key", post(reset_key))
        .route("/status/:key", get(key_status))
        .route("/cleanup", post(run_cleanup))
        .route("/metrics/reset", post(reset_metrics))
        .with_state(gatekeeper)
}

/// `/report`, `/realtime`, `/health` for the operational dashboard.
pub fn diagnostics_router(gatekeeper: SharedGatekeeper) -> Router {
    Router::new()
        .route("/report", get(report))
        .route("/realtime", get(real_time))
        .route("/health", get(health))
        .with_state(gatekeeper)
}

async fn reset_key(
    State(gatekeeper): State<SharedGatekeeper>,
    Path(key): Path<String>,
) -> Response {
    let key = RateLimitKey::from_raw(key);
    match gatekeeper.reset(&key).await {
        Ok(()) => {
            info!(key = %key, "limiter state reset by operator");
            Json(json!({ "reset": key.as_str() })).into_response()
        }
        Err(e) => {
            warn!(key = %key, error = %e, "reset failed");
            store_unavailable()
        }
    }
}

#[derive(Deserialize)]
struct StatusParams {
    #[serde(default = "default_status_limit")]
    limit: u64,
    #[serde(default = "default_status_window")]
    window_secs: u64,
}

fn default_status_limit() -> u64 {
    100
}

fn default_status_window() -> u64 {
    60
}

async fn key_status(
    State(gatekeeper): State<SharedGatekeeper>,
    Path(key): Path<String>,
    Query(params): Query<StatusParams>,
) -> Response {
    let key = RateLimitKey::from_raw(key);
    let now_ms = Utc::now().timestamp_millis();
    match gatekeeper
        .status(
            &key,
            params.limit,
            Duration::from_secs(params.window_secs),
            now_ms,
        )
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            warn!(key = %key, error = %e, "status query failed");
            store_unavailable()
        }
    }
}

async fn run_cleanup(State(gatekeeper): State<SharedGatekeeper>) -> Response {
    let now_ms = Utc::now().timestamp_millis();
    match gatekeeper.cleanup(now_ms).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => {
            warn!(error = %e, "manual cleanup failed");
            store_unavailable()
        }
    }
}

async fn reset_metrics(State(gatekeeper): State<SharedGatekeeper>) -> Response {
    gatekeeper.metrics().reset();
    Json(json!({ "reset": "metrics" })).into_response()
}

async fn report(State(gatekeeper): State<SharedGatekeeper>) -> Response {
    Json(gatekeeper.metrics().report()).into_response()
}

#[derive(Deserialize)]
struct RealTimeParams {
    #[serde(default = "default_realtime_window")]
    window_secs: u64,
}

fn default_realtime_window() -> u64 {
    60
}

async fn real_time(
    State(gatekeeper): State<SharedGatekeeper>,
    Query(params): Query<RealTimeParams>,
) -> Response {
    let now_ms = Utc::now().timestamp_millis();
    Json(
        gatekeeper
            .metrics()
            .real_time(Duration::from_secs(params.window_secs), now_ms),
    )
    .into_response()
}

async fn health(State(gatekeeper): State<SharedGatekeeper>) -> Response {
    let now_ms = Utc::now().timestamp_millis();
    let status = gatekeeper.metrics().health(now_ms);
    let code = match status.status {
        HealthState::Ok | HealthState::Degraded => StatusCode::OK,
        HealthState::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(status)).into_response()
}

fn store_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "store_unavailable" })),
    )
        .into_response()
}
