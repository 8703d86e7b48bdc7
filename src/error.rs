//! Error types for the compile router.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Request-fatal errors surfaced to clients.
///
/// Infrastructure failures with a safe default (routing lookup, active color,
/// overflowed-result fetch) are recovered in place and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The event-bus subscription could not be issued.
    #[error("Failed to subscribe to compilation events: {0}")]
    Subscribe(String),

    /// The queue publish failed before a waiter was armed.
    #[error("Failed to submit compilation request: {0}")]
    QueuePublish(String),

    /// No result arrived for the correlation id within the deadline.
    #[error("Compilation timeout: No response received within {timeout} seconds for GUID: {guid}")]
    Timeout { guid: String, timeout: u64 },

    /// The direct HTTP backend could not be reached.
    #[error("Failed to forward request to backend: {0}")]
    Forward(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RouterError::Subscribe(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::QueuePublish(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            RouterError::Forward(_) => StatusCode::BAD_GATEWAY,
            RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
