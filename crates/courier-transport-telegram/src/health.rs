//! Read-only health endpoint for container orchestrators.

use axum::{extract::State, response::Json, routing::get, Router};
use courier_core::controller::{ControllerHandle, RunState, StatusSnapshot};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Body of `GET /` and `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Controller state
    pub status: RunState,
    /// Total messages forwarded
    pub forwarded: u64,
    /// Seconds since the active run started
    pub uptime_secs: Option<u64>,
    /// Configured source channel
    pub source: Option<String>,
    /// Configured target channel
    pub target: Option<String>,
    /// Ordinal of the last forwarded message
    pub last_id: Option<i64>,
}

impl From<&StatusSnapshot> for HealthReport {
    fn from(status: &StatusSnapshot) -> Self {
        Self {
            status: status.state,
            forwarded: status.forwarded,
            uptime_secs: status.uptime_secs,
            source: status.source.as_ref().map(ToString::to_string),
            target: status.target.as_ref().map(ToString::to_string),
            last_id: status.last_id,
        }
    }
}

/// Creates the health router.
pub fn create_router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .with_state(controller)
}

/// Health check endpoint.
pub async fn health_check(State(controller): State<ControllerHandle>) -> Json<HealthReport> {
    Json(HealthReport::from(&controller.snapshot()))
}

/// Serve the health router until the task is dropped.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(addr: SocketAddr, controller: ControllerHandle) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health endpoint listening");
    axum::serve(listener, create_router(controller)).await?;
    Ok(())
}
