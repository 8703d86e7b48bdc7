//! Health check and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

/// Health check endpoint
///
/// GET /healthcheck
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let websocket = if state.bus.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "websocket": websocket,
    }))
}

/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::encode_metrics() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
