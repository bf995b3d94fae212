//! Agent-facing HTTP API.
//!
//! The agent process talks back to the operator through a small JSON API
//! bound to `127.0.0.1:http_port`. Every route forwards to the
//! orchestrator handle; no relay state lives here.

pub mod routes;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::OrchestratorHandle;
use crate::{AppError, Result};

/// Shared state handed to every route.
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Orchestrator input.
    pub orchestrator: OrchestratorHandle,
}

/// Build the API router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/send", post(routes::send))
        .route("/ask", post(routes::ask))
        .route("/send_file", post(routes::send_file))
        .with_state(state)
}

/// Bind `127.0.0.1:port` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound or the server
/// fails.
pub async fn serve(state: ApiState, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP API on {bind}: {err}")))?;
    serve_on(listener, state, ct).await
}

/// Serve on an already bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails.
pub async fn serve_on(listener: TcpListener, state: ApiState, ct: CancellationToken) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Config(format!("listener has no address: {err}")))?;
    info!(%local, "starting HTTP API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("HTTP API error: {err}")))?;

    info!("HTTP API shut down");
    Ok(())
}
