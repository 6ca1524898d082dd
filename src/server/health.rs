//! Health, status and metrics endpoints
//!
//! - `/healthz` - Liveness: is portier itself alive?
//! - `/readyz` - Readiness: is the supervised server running?
//! - `/status` - Current lifecycle phase as JSON
//! - `/metrics` - Prometheus metrics in text format

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Lifecycle phase of the entrypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    WaitingForDependencies = 0,
    Migrating = 1,
    Starting = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
    Failed = 6,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::WaitingForDependencies,
            1 => Phase::Migrating,
            2 => Phase::Starting,
            3 => Phase::Running,
            4 => Phase::Stopping,
            5 => Phase::Stopped,
            _ => Phase::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WaitingForDependencies => "waiting_for_dependencies",
            Phase::Migrating => "migrating",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        }
    }
}

/// Shared lifecycle phase, written by the bootstrap and supervisor
#[derive(Debug, Clone)]
pub struct StatusState {
    phase: Arc<AtomicU8>,
}

impl StatusState {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(Phase::WaitingForDependencies as u8)),
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Ready means traffic may be routed to the container
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Running
    }
}

impl Default for StatusState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ServerState {
    status: StatusState,
    metrics: SharedMetrics,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    phase: Phase,
    ready: bool,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(state): State<ServerState>) -> Json<StatusBody> {
    Json(StatusBody {
        phase: state.status.phase(),
        ready: state.status.is_ready(),
    })
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub(crate) fn build_router(status_state: StatusState, metrics_registry: SharedMetrics) -> Router {
    let state = ServerState {
        status: status_state,
        metrics: metrics_registry,
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the status server until `shutdown` fires
///
/// Binds on all interfaces so the container runtime's probes can reach it.
pub async fn run_status_server(
    port: u16,
    status: StatusState,
    metrics: SharedMetrics,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = build_router(status, metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(std::io::Error::other)
}
