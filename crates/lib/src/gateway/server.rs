//! Host HTTP server: health, emit endpoint, and the WebSocket gateway on one port.

use super::broadcast::{BroadcastGateway, GatewayState};
use super::protocol::{BroadcastReport, Envelope};
use super::transport::ROUTE_PREFIX;
use super::ws::WsServerFactory;
use crate::config::{self, Config};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    gateway: Arc<BroadcastGateway<WsServerFactory>>,
    /// When Some, `POST /emit` must carry `Authorization: Bearer <token>`.
    emit_token: Option<String>,
    port: u16,
    started_at: DateTime<Utc>,
}

/// Run the server on config.server.bind:config.server.port until SIGINT or SIGTERM.
/// When bind is not loopback, an emit token must be configured or startup fails.
pub async fn run_server(config: Config) -> Result<()> {
    run_server_with_shutdown(config, shutdown_signal()).await
}

/// Like `run_server`, but stops when `shutdown` completes. Clients are disconnected
/// through the gateway before the HTTP server drains.
pub async fn run_server_with_shutdown<S>(config: Config, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let bind = config.server.bind.trim().to_string();
    let emit_token = config::resolve_emit_token(&config);
    if !config::is_loopback_bind(&bind) && emit_token.is_none() {
        anyhow::bail!(
            "refusing to bind to {} without an emit token (set server.emitToken or FANOUT_EMIT_TOKEN)",
            bind
        );
    }

    let gateway = Arc::new(BroadcastGateway::new(WsServerFactory));
    let state = AppState {
        gateway: gateway.clone(),
        emit_token,
        port: config.server.port,
        started_at: Utc::now(),
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/emit", post(emit_http))
        .with_state(state);
    let app = gateway
        .start(config.transport.clone(), app)
        .context("starting websocket transport")?;

    let bind_addr = format!("{}:{}", bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!(
        "listening on {}; clients connect at ws://{}{}{}",
        bind_addr,
        bind_addr,
        ROUTE_PREFIX,
        config.transport.path
    );

    let stopping = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, disconnecting clients");
            stopping.stop();
        })
        .await
        .context("server exited")?;
    // Covers the server exiting on its own.
    gateway.stop();
    log::info!("server stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "state": state.gateway.state(),
        "connections": state.gateway.connection_count(),
        "port": state.port,
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// POST /emit broadcasts the posted envelope and returns the broadcast report.
async fn emit_http(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Result<Json<BroadcastReport>, StatusCode> {
    if let Some(ref expected) = state.emit_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != expected.as_str() {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    if state.gateway.state() != GatewayState::Running {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(state.gateway.broadcast(&envelope)))
}
