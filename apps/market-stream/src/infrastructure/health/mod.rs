//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, subscription status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of every subscription and breaker
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (at least one subscription connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::services::{SupervisorHandle, SupervisorSnapshot};
use crate::domain::connection::ConnectionState;
use crate::domain::market::TradingPair;
use crate::domain::resilience::CircuitBreakerSnapshot;
use crate::infrastructure::broadcast::SharedBroadcastHub;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Current symbol session.
    pub session_id: Option<Uuid>,
    /// Active trading pair.
    pub symbol: Option<TradingPair>,
    /// Per-subscription status.
    pub subscriptions: Vec<SubscriptionInfo>,
    /// Circuit breakers.
    pub breakers: Vec<CircuitBreakerSnapshot>,
    /// Total broadcast receivers.
    pub broadcast_receivers: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every subscription connected.
    Healthy,
    /// Some subscriptions connected, or recovering.
    Degraded,
    /// Nothing connected, or the supervisor stopped.
    Unhealthy,
}

/// Individual subscription status.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// Subscription identity (`provider:BASE/QUOTE:stream`).
    pub id: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Connection attempts made.
    pub attempts: u64,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempt: u32,
    /// Last error, if any.
    pub last_error: Option<String>,
    /// When the subscription last connected.
    pub last_connected_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    supervisor: SupervisorHandle,
    broadcast_hub: SharedBroadcastHub,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        supervisor: SupervisorHandle,
        broadcast_hub: SharedBroadcastHub,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            supervisor,
            broadcast_hub,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(
        &state.supervisor.latest(),
        &state.version,
        state.started_at.elapsed().as_secs(),
        state.broadcast_hub.stats().total_receivers(),
    );
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let snapshot = state.supervisor.latest();
    if snapshot.running && snapshot.count(ConnectionState::Connected) > 0 {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(
    snapshot: &SupervisorSnapshot,
    version: &str,
    uptime_secs: u64,
    broadcast_receivers: usize,
) -> HealthResponse {
    let subscriptions = snapshot
        .subscriptions
        .iter()
        .map(|sub| SubscriptionInfo {
            id: sub.id.to_string(),
            state: sub.state,
            attempts: sub.stats.attempts,
            reconnect_attempt: sub.reconnect_attempt,
            last_error: sub.stats.last_error.as_ref().map(ToString::to_string),
            last_connected_at: sub.stats.last_connected_at,
        })
        .collect();

    HealthResponse {
        status: determine_health_status(snapshot),
        version: version.to_string(),
        uptime_secs,
        current_time: Utc::now(),
        session_id: snapshot.session_id,
        symbol: snapshot.symbol.clone(),
        subscriptions,
        breakers: snapshot.breakers.clone(),
        broadcast_receivers,
    }
}

fn determine_health_status(snapshot: &SupervisorSnapshot) -> HealthStatus {
    let total = snapshot.subscriptions.len();
    let connected = snapshot.count(ConnectionState::Connected);

    if !snapshot.running || total == 0 || connected == 0 {
        HealthStatus::Unhealthy
    } else if connected == total {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
