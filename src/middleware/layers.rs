//! Axum middleware wiring for the gatekeeper service.
//!
//! Each layer is an `axum::middleware::from_fn_with_state` function plus a
//! small cloneable state struct binding it to the shared service. Routes
//! opt in per strategy:
//!
//! ```ignore
//! Router::new()
//!     .route("/api/auth/login", post(login))
//!     .route_layer(middleware::from_fn_with_state(
//!         LimitState::new(gatekeeper.clone(), StrategyId::Auth),
//!         limit,
//!     ))
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, request::Parts, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use crate::dedup::{request_key, DedupOutcome, DedupWaitError, Flight};
use crate::limit::{LimitOverrides, RequestIdentity, StrategyId, TokenBucketConfig};

use super::facade::{SharedGatekeeper, Verdict};

/// State for the sliding-window `limit` layer.
#[derive(Clone)]
pub struct LimitState {
    pub gatekeeper: SharedGatekeeper,
    pub strategy: StrategyId,
    pub overrides: LimitOverrides,
}

impl LimitState {
    pub fn new(gatekeeper: SharedGatekeeper, strategy: StrategyId) -> Self {
        Self {
            gatekeeper,
            strategy,
            overrides: LimitOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: LimitOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// State for the token-bucket `bucket_limit` layer.
#[derive(Clone)]
pub struct BucketLimitState {
    pub gatekeeper: SharedGatekeeper,
    pub strategy: StrategyId,
    pub bucket: TokenBucketConfig,
}

impl BucketLimitState {
    pub fn new(
        gatekeeper: SharedGatekeeper,
        strategy: StrategyId,
        bucket: TokenBucketConfig,
    ) -> Self {
        Self {
            gatekeeper,
            strategy,
            bucket,
        }
    }
}

/// Key derivation hook for the dedup layer. `None` bypasses dedup.
pub type KeyGenerator =
    Arc<dyn Fn(&RequestIdentity, &Parts, &[u8]) -> Option<String> + Send + Sync>;

/// State for the `deduplicate` layer.
#[derive(Clone)]
pub struct DedupState {
    pub gatekeeper: SharedGatekeeper,
    key_generator: KeyGenerator,
}

impl DedupState {
    /// Dedup on method + path + principal + body digest, for mutating
    /// methods only. Reads are cheap and idempotent already.
    pub fn new(gatekeeper: SharedGatekeeper) -> Self {
        Self {
            gatekeeper,
            key_generator: Arc::new(|identity, parts, body| {
                match parts.method.as_str() {
                    "POST" | "PUT" | "PATCH" => Some(request_key(
                        parts.method.as_str(),
                        parts.uri.path(),
                        identity.principal(),
                        body,
                    )),
                    _ => None,
                }
            }),
        }
    }

    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }
}

/// Pull the caller's identity out of the request.
///
/// The surrounding framework authenticates upstream of this layer and
/// forwards the user id as a header; unauthenticated traffic falls back to
/// the client address.
pub(crate) fn extract_identity(request: &Request) -> RequestIdentity {
    let headers = request.headers();
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    RequestIdentity {
        user_id,
        ip,
        path: request.uri().path().to_string(),
    }
}

/// Sliding-window rate limit layer.
pub async fn limit(State(state): State<LimitState>, request: Request, next: Next) -> Response {
    let identity = extract_identity(&request);
    let now_ms = Utc::now().timestamp_millis();

    let verdict = state
        .gatekeeper
        .evaluate(state.strategy, &state.overrides, &identity, now_ms)
        .await;

    respond_to_verdict(verdict, now_ms, request, next).await
}

/// Token-bucket rate limit layer.
pub async fn bucket_limit(
    State(state): State<BucketLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = extract_identity(&request);
    let now_ms = Utc::now().timestamp_millis();

    let verdict = state
        .gatekeeper
        .evaluate_bucket(state.strategy, &state.bucket, &identity, now_ms)
        .await;

    respond_to_verdict(verdict, now_ms, request, next).await
}

async fn respond_to_verdict(
    verdict: Verdict,
    now_ms: i64,
    request: Request,
    next: Next,
) -> Response {
    match verdict {
        Verdict::Allow {
            limit,
            remaining,
            reset_ms,
        } => {
            let mut response = next.run(request).await;
            set_rate_limit_headers(&mut response, limit, remaining, reset_ms);
            response
        }
        Verdict::Deny {
            limit,
            reset_ms,
            message,
        } => rejection("rate_limited", &message, limit, reset_ms, now_ms),
        Verdict::Block { until_ms, message } => {
            rejection("blocked", &message, 0, until_ms, now_ms)
        }
    }
}

fn set_rate_limit_headers(response: &mut Response, limit: u64, remaining: u64, reset_ms: i64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&(reset_ms / 1000).to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

/// Build the 429 response shared by denials and blocks.
fn rejection(error: &str, message: &str, limit: u64, reset_ms: i64, now_ms: i64) -> Response {
    // Round the retry hint up so "try again" is never early.
    let retry_after_secs = ((reset_ms - now_ms).max(0) + 999) / 1000;

    let body = json!({
        "error": error,
        "message": message,
        "limit": limit,
        "remaining": 0,
        "reset": reset_ms / 1000,
        "retryAfter": retry_after_secs,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    set_rate_limit_headers(&mut response, limit, 0, reset_ms);
    if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
    }
    response
}

/// Single-flight deduplication layer.
///
/// The leader's execution is spawned as a detached task: a leader whose
/// client disconnects mid-flight does not cancel the execution, because
/// followers may still be waiting on its outcome.
pub async fn deduplicate(
    State(state): State<DedupState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = extract_identity(&request);
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, state.gatekeeper.dedup_max_body()).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(path = %parts.uri.path(), "request body exceeded dedup buffer limit");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let key = (state.key_generator)(&identity, &parts, &bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    let key = match key {
        Some(key) => key,
        None => return next.run(request).await,
    };

    match state.gatekeeper.dedup().begin(&key) {
        Flight::Leader(guard) => {
            let execution = tokio::spawn(async move {
                let response = next.run(request).await;
                let outcome = outcome_from_response(response).await;
                guard.complete(outcome.clone());
                outcome
            });
            match execution.await {
                Ok(outcome) => outcome_into_response(outcome),
                Err(e) => {
                    error!(key = %key, error = %e, "coalesced execution panicked");
                    coalesce_failure("The request could not be completed.")
                }
            }
        }
        Flight::Follower(rx) => match state.gatekeeper.dedup().wait(rx).await {
            Ok(outcome) => outcome_into_response(outcome),
            Err(DedupWaitError::LeaderVanished) => {
                coalesce_failure("The request could not be completed.")
            }
            Err(DedupWaitError::Timeout) => {
                coalesce_failure("Timed out waiting for an identical in-flight request.")
            }
        },
    }
}

async fn outcome_from_response(response: Response) -> DedupOutcome {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();
    DedupOutcome {
        status,
        content_type,
        body,
    }
}

fn outcome_into_response(outcome: DedupOutcome) -> Response {
    let status =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(outcome.body));
    *response.status_mut() = status;
    if let Some(content_type) = outcome.content_type {
        if let Ok(v) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, v);
        }
    }
    response
}

fn coalesce_failure(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "dedup_failed", "message": message })),
    )
        .into_response()
}

/// Metrics recording layer.
///
/// Observes the finalized response explicitly on the way out; no response
/// method patching, the layer *is* the interception point.
pub async fn track_metrics(
    State(gatekeeper): State<SharedGatekeeper>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    gatekeeper.metrics().record(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
        Utc::now().timestamp_millis(),
    );
    response
}
