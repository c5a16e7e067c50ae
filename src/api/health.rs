//! Liveness endpoint.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::types::PROTOCOL_VERSION;
use crate::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    server_id: String,
    protocol_version: u32,
    connections: usize,
    timestamp: i64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_id: state.config.server_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        connections: state.supervisor.session_count(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}
