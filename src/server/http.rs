//! HTTP transport: the `/rpc` endpoint plus operability probes.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde_json::json;
use tracing::info;

use crate::error::{AppError, AppResult};

use super::{rpc, SharedState};

/// Build the router. The auth layer sits outside the routes so rejected
/// requests never reach dispatch or metrics.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(auth_middleware))
        .layer(Extension(state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Middleware: shared-secret bearer auth.
/// Health and readiness probes are always public; an empty configured token
/// means open access.
async fn auth_middleware(
    Extension(state): Extension<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == "/ready" {
        return next.run(req).await;
    }

    let expected = &state.config.server.auth_token;
    if expected.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    if presented.is_some_and(|token| constant_time_eq(token.as_bytes(), expected.as_bytes())) {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Invalid or missing bearer token"})),
    )
        .into_response()
}

/// Byte comparison that does not short-circuit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// POST /rpc. The body is parsed by hand so malformed JSON still yields a
/// JSON-RPC -32700 response instead of a bare HTTP 400.
async fn rpc_handler(Extension(state): Extension<SharedState>, body: String) -> impl IntoResponse {
    let response = rpc::handle_raw(&state, &body).await;
    Json(response)
}

/// GET /health.
async fn health_handler(Extension(state): Extension<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tools": state.tools.len(),
        "uptime_sec": state.metrics.uptime_sec(),
    }))
}

/// GET /ready.
async fn ready_handler() -> impl IntoResponse {
    Json(json!({"status": "ready"}))
}

/// GET /metrics.
async fn metrics_handler(Extension(state): Extension<SharedState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Serve until SIGINT/SIGTERM.
pub async fn serve(state: SharedState) -> AppResult<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()
    .map_err(|e| AppError::Config {
        message: format!("invalid listen address: {e}"),
    })?;

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "JSON-RPC server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
