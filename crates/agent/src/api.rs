//! HTTP API for health checks, Prometheus metrics and the collector feeds
//!
//! Besides the probes this exposes the two inbound feeds of the agent:
//! learned port addresses and switch database table updates.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ovs_agent_lib::{
    health::{ComponentStatus, HealthRegistry},
    ipcache::LearnedAddresses,
    observability::AgentMetrics,
    ovsdb::TableUpdates,
    sync::AgentMonitor,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub learned_tx: mpsc::Sender<LearnedAddresses>,
    pub table_updates_tx: mpsc::Sender<TableUpdates>,
    pub monitor: Arc<AgentMonitor>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        learned_tx: mpsc::Sender<LearnedAddresses>,
        table_updates_tx: mpsc::Sender<TableUpdates>,
        monitor: Arc<AgentMonitor>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            learned_tx,
            table_updates_tx,
            monitor,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Accept a batch of `{"<bridge>-<ofport>": "<ip>"}` learned addresses
async fn learned_addresses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HashMap<String, String>>,
) -> Response {
    let mut batch = LearnedAddresses::with_capacity(body.len());
    for (port_key, raw) in body {
        match raw.parse::<IpAddr>() {
            Ok(ip) => {
                batch.insert(port_key, ip);
            }
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid address {:?} for port {}", raw, port_key),
                )
            }
        }
    }

    let count = batch.len();
    if state.learned_tx.send(batch).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "address learning stopped");
    }

    debug!(addresses = count, "Queued learned addresses");
    (StatusCode::ACCEPTED, Json(json!({ "accepted": count }))).into_response()
}

/// Accept an RFC 7047 table-updates object
async fn table_updates(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let updates = match TableUpdates::from_json(&body) {
        Ok(updates) => updates,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let tables = updates.tables.len();
    if state.table_updates_tx.send(updates).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "cache mirror stopped");
    }

    (StatusCode::ACCEPTED, Json(json!({ "tables": tables }))).into_response()
}

/// The AgentInfo this agent last persisted
async fn agentinfo(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.last_persisted() {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("agentinfo {} not persisted yet", state.monitor.name()),
        ),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/learned-addresses", post(learned_addresses))
        .route("/v1/table-updates", post(table_updates))
        .route("/v1/agentinfo", get(agentinfo))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
