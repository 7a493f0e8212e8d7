//! Server startup and router construction.

use axum::{
    http::{HeaderName, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::api;
use crate::config::Config;
use crate::registry::{HealthProber, ProbeConfig};
use crate::shared_state::AppState;

/// Run the gateway until Ctrl-C.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let state = AppState::from_config(cfg)?;

    let shutdown = CancellationToken::new();
    let prober = HealthProber::new(Arc::clone(&state.registry), ProbeConfig::from(state.config.as_ref()))
        .spawn(shutdown.child_token());

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = prober.await {
        warn!("Health prober ended abnormally: {}", e);
    }
    info!("Gateway stopped");
    Ok(())
}

/// Router with every gateway route and the HTTP layers.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(api::ROUTING_HEADER),
            HeaderName::from_static(api::PARTIAL_HEADER),
            HeaderName::from_static(api::DOMAIN_HEADER),
        ]);
    let request_timeout = Duration::from_secs(state.config.request_timeout_seconds);

    Router::new()
        .route("/v1/chat/completions", post(api::create_chat_completion))
        .route("/v1/models", get(api::list_models))
        .route("/v1/models/:id", get(api::get_model))
        .route("/admin/backends", get(api::list_backends).post(api::register_backend))
        .route("/admin/backends/:id", delete(api::delete_backend))
        .route("/healthz", get(api::health))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
