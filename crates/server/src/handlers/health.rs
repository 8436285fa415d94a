//! Health check endpoints.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Health status ("ok")
    pub status: String,
}

/// Detailed health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    pub status: String,
    pub server_name: String,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Basic health check endpoint.
///
/// `GET /health`
///
/// Returns quickly; suitable for load balancer health checks.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// Detailed API health check endpoint.
///
/// `GET /api/health`
pub async fn api_health(State(state): State<AppState>) -> Json<ApiHealthResponse> {
    Json(ApiHealthResponse {
        status: "ok".to_string(),
        server_name: state.config.server_name.clone(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
