//! Schedule management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use windlass_engine::{ScheduleInfo, ScheduleSpec};

use crate::error::ApiResult;
use crate::state::AppState;

/// Create an interval schedule.
///
/// `POST /api/schedules`
pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<ScheduleSpec>,
) -> ApiResult<StatusCode> {
    state.engine.create_schedule(spec)?;
    Ok(StatusCode::CREATED)
}

/// List all schedules with action telemetry.
///
/// `GET /api/schedules`
pub async fn list(State(state): State<AppState>) -> Json<Vec<ScheduleInfo>> {
    Json(state.engine.list_schedules())
}

/// Describe one schedule.
///
/// `GET /api/schedules/{schedule_id}`
pub async fn describe(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<Json<ScheduleInfo>> {
    Ok(Json(state.engine.describe_schedule(&schedule_id)?))
}

/// Delete a schedule. Started executions are unaffected.
///
/// `DELETE /api/schedules/{schedule_id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_schedule(&schedule_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pause ticking.
///
/// `POST /api/schedules/{schedule_id}/pause`
pub async fn pause(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.pause_schedule(&schedule_id)?;
    Ok(StatusCode::OK)
}

/// Resume ticking.
///
/// `POST /api/schedules/{schedule_id}/unpause`
pub async fn unpause(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.unpause_schedule(&schedule_id)?;
    Ok(StatusCode::OK)
}

/// Take one action immediately, regardless of pause state or interval.
///
/// `POST /api/schedules/{schedule_id}/trigger`
pub async fn trigger(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.trigger_schedule(&schedule_id)?;
    Ok(StatusCode::ACCEPTED)
}
