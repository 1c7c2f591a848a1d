//! Error taxonomy (spec §7) and the two boundary types that turn errors into
//! HTTP responses.
//!
//! [`RouterError`] is the precise, status-code-accurate enum for the
//! gateway-facing surface — every dispatch outcome lands in one of its
//! variants. [`AppError`] is kept, unchanged in spirit from the teacher
//! crate, as the catch-all for admin/introspection handlers where a single
//! 500 with a logged cause is the right amount of ceremony.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::domain::AttemptDiagnostic;

/// Gateway-facing error taxonomy. Each variant maps to the HTTP status named
/// in spec §7.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Malformed request body, unknown model, invalid priority. 4xx, never
    /// retried, never counted against a backend.
    #[error("invalid request: {0}")]
    ClientError(String),

    /// No alive, non-excluded backend exists. 503, emits an alert-level
    /// event, not retried within this request.
    #[error("no backend available")]
    NoBackendAvailable,

    /// All retry attempts were exhausted. 502, carries per-attempt
    /// diagnostics.
    #[error("all dispatch attempts failed")]
    AllAttemptsFailed(Vec<AttemptDiagnostic>),

    /// The priority queue is at `max_queue_size`. 429, not retried.
    #[error("queue is full")]
    QueueFull,

    /// The client disconnected or the caller-supplied deadline elapsed
    /// before a response was produced. Terminal; no retry follows.
    #[error("request cancelled")]
    Cancelled,
}

impl RouterError {
    fn status(&self) -> StatusCode {
        match self {
            Self::ClientError(_) => StatusCode::BAD_REQUEST,
            Self::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllAttemptsFailed(_) => StatusCode::BAD_GATEWAY,
            Self::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        match &self {
            Self::NoBackendAvailable => tracing::error!("no backend available for dispatch"),
            Self::AllAttemptsFailed(attempts) => {
                tracing::warn!(attempt_count = attempts.len(), "all dispatch attempts failed")
            }
            _ => tracing::debug!(error = %self, "request rejected"),
        }

        let status = self.status();
        let body = match &self {
            Self::AllAttemptsFailed(attempts) => json!({
                "error": self.to_string(),
                "failed_attempts": attempts,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from admin/introspection
/// axum handlers, exactly as the teacher crate's `AppError` does.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_maps_to_400() {
        let resp = RouterError::ClientError("bad model".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn no_backend_available_maps_to_503() {
        let resp = RouterError::NoBackendAvailable.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn all_attempts_failed_maps_to_502() {
        let resp = RouterError::AllAttemptsFailed(vec![]).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn queue_full_maps_to_429() {
        let resp = RouterError::QueueFull.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
