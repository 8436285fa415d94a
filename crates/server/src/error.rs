//! API error types implementing `IntoResponse` for Axum handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use windlass_engine::EngineError;

/// Application-level errors for the API surface.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (duplicate workflow id, schedule id, append race)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The workflow closed with a failure; surfaced with its details intact
    #[error("Workflow failed: {0}")]
    WorkflowFailure(windlass_engine::Failure),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(msg) => ApiError::NotFound(msg),
            EngineError::AlreadyExists(msg) => ApiError::Conflict(msg),
            EngineError::LogConflict { .. } | EngineError::NonDeterminism(_) => {
                ApiError::Conflict(e.to_string())
            }
            EngineError::Validation(msg) => ApiError::BadRequest(msg),
            EngineError::WorkflowFailure(failure) => ApiError::WorkflowFailure(failure),
            EngineError::Serialization(err) => ApiError::BadRequest(err.to_string()),
            EngineError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({"error": "not_found", "detail": msg}),
            ),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                json!({"error": "conflict", "detail": msg}),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "bad_request", "detail": msg}),
            ),
            ApiError::WorkflowFailure(failure) => (
                StatusCode::OK,
                json!({"status": "failed", "failure": failure}),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal", "detail": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Convenience alias for handler return types.
pub type ApiResult<T> = Result<T, ApiError>;
