//! HTTP gateway: official-account webhook, counter API, health and metrics.

pub mod counter;
pub mod message;
pub mod wechat;

pub use message::{InboundMessage, OutboundReply, ParseError, WireFormat};
pub use wechat::{Clock, Dispatch, SystemClock, VerifyQuery, WebhookDispatcher, WebhookError};

use crate::config::Config;
use crate::counter::{CounterStore, SqliteCounterStore};
use crate::observability::Metrics;
use crate::providers::create_provider;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<WebhookDispatcher>,
    pub counter_store: Arc<dyn CounterStore>,
    pub metrics: Metrics,
}

/// Builds the router with all routes and layers.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(
            "/handle",
            get(wechat::handle_verify).post(wechat::handle_message),
        )
        .route(
            "/api/count",
            get(counter::handle_get_count).post(counter::handle_post_count),
        )
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wires the configured provider, cache and counter store, then serves until
/// Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let metrics = Metrics::new()?;
    let provider = create_provider(&config.provider)?;
    let dispatcher = WebhookDispatcher::new(&config.wechat, provider.clone(), metrics.clone());

    let db_path = config.database.resolved_path();
    let counter_store = SqliteCounterStore::open(&db_path)?;

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        counter_store: Arc::new(counter_store),
        metrics,
    };
    let app = build_router(state, config.gateway.max_body_bytes);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind gateway on {addr}"))?;

    tracing::info!(
        "wxrelay listening on {addr} (provider={}, trigger={:?}, cache={}, db={})",
        provider.name(),
        config.wechat.trigger_prefix,
        config.wechat.cache_capacity,
        db_path.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("metrics render failed: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
