//! HTTP server. The site front-end posts deposits and withdrawals here.
//!
//! CORS is restricted to the configured origin (`*` allows any).

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::ServerConfig;
use routes::AppState;

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState, allowed_origin: &str) -> Result<Router> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = if allowed_origin == "*" {
        cors.allow_origin(Any)
    } else {
        let origin = allowed_origin
            .parse::<HeaderValue>()
            .with_context(|| format!("Invalid allowed_origin {allowed_origin:?}"))?;
        cors.allow_origin(origin)
    };

    Ok(Router::new()
        .route("/user-deposit", post(routes::user_deposit))
        .route("/user-withdraw", post(routes::user_withdraw))
        .route("/health", get(routes::health))
        .fallback(routes::fallback)
        .layer(cors)
        .with_state(state))
}

/// Start the HTTP server in a background task.
///
/// The server stops accepting connections once `shutdown` flips and lets
/// in-flight requests finish.
pub async fn spawn_server(
    state: AppState,
    cfg: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<()>>> {
    let app = build_router(state, &cfg.allowed_origin)?;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", cfg.port))?;
    info!(port = cfg.port, "HTTP server listening on http://localhost:{}", cfg.port);

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("HTTP server error")
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
