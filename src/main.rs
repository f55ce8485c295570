use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::limit::{StrategyId, TokenBucketConfig};
use gatekeeper::middleware::{
    admin_router, bucket_limit, deduplicate, diagnostics_router, limit, track_metrics,
    BucketLimitState, DedupState, Gatekeeper, LimitState,
};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "Request throttling and coalescing demo server")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GatekeeperConfig::from_file(path)?,
        None => GatekeeperConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let gatekeeper = Arc::new(Gatekeeper::new(&config)?);
    let janitor = gatekeeper.spawn_janitor();

    let app = demo_routes(gatekeeper.clone())
        .nest("/admin", admin_router(gatekeeper.clone()))
        .nest("/diagnostics", diagnostics_router(gatekeeper.clone()))
        .layer(middleware::from_fn_with_state(
            gatekeeper.clone(),
            track_metrics,
        ));

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("Listening on {}", config.server.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    janitor.abort();
    info!("Gatekeeper stopped");
    Ok(())
}

/// Stand-ins for the platform's business controllers, each behind the
/// throttle strategy it would carry in production.
fn demo_routes(gatekeeper: Arc<Gatekeeper>) -> Router {
    let login = Router::new()
        .route(
            "/api/auth/login",
            post(|| async { Json(serde_json::json!({ "token": "demo" })) }),
        )
        .route_layer(middleware::from_fn_with_state(
            LimitState::new(gatekeeper.clone(), StrategyId::Auth),
            limit,
        ));

    // AI-backed endpoint: bursty demand, so a token bucket instead of a
    // plain window, plus single-flight dedup of identical prompts.
    let chat = Router::new()
        .route(
            "/api/chat",
            post(|| async { Json(serde_json::json!({ "reply": "demo" })) }),
        )
        .route_layer(middleware::from_fn_with_state(
            DedupState::new(gatekeeper.clone()),
            deduplicate,
        ))
        .route_layer(middleware::from_fn_with_state(
            BucketLimitState::new(
                gatekeeper.clone(),
                StrategyId::Chat,
                TokenBucketConfig {
                    max_burst: 5.0,
                    refill_rate: 1.0,
                    interval: Duration::from_secs(10),
                    cost: 1.0,
                },
            ),
            bucket_limit,
        ));

    let jobs = Router::new()
        .route(
            "/api/jobs/search",
            get(|| async { Json(serde_json::json!({ "jobs": [] })) }),
        )
        .route_layer(middleware::from_fn_with_state(
            LimitState::new(gatekeeper.clone(), StrategyId::JobSearch),
            limit,
        ));

    let general = Router::new()
        .route(
            "/api/health",
            get(|| async { Json(serde_json::json!({ "status": "healthy" })) }),
        )
        .route_layer(middleware::from_fn_with_state(
            LimitState::new(gatekeeper, StrategyId::General),
            limit,
        ));

    login.merge(chat).merge(jobs).merge(general)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
