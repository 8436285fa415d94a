//! Worker RPC endpoints: task polling and attempt reporting.
//!
//! Polls are long polls; they hold the request open up to the configured
//! poll timeout and return `204 No Content` when nothing arrived.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use windlass_engine::{ActivityTask, Command, EventId, Failure};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub task_queue: String,
}

/// Long-poll for a workflow task.
///
/// `POST /api/tasks/workflow/poll`
pub async fn poll_workflow(
    State(state): State<AppState>,
    Json(req): Json<PollRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .poll_workflow_task(&req.task_queue, state.poll_timeout())
        .await
    {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteWorkflowTaskRequest {
    pub task_token: Uuid,
    pub starting_event_id: EventId,
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Report workflow task completion with the decision commands.
///
/// `POST /api/tasks/workflow/complete`
///
/// Returns `409 Conflict` when the history advanced past the event id the
/// worker replayed through; the engine schedules a replacement task.
pub async fn complete_workflow(
    State(state): State<AppState>,
    Json(req): Json<CompleteWorkflowTaskRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .complete_workflow_task(req.task_token, req.starting_event_id, req.commands)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct FailWorkflowTaskRequest {
    pub task_token: Uuid,
    pub failure: Failure,
}

/// Fail the run from a workflow task.
///
/// `POST /api/tasks/workflow/fail`
pub async fn fail_workflow(
    State(state): State<AppState>,
    Json(req): Json<FailWorkflowTaskRequest>,
) -> ApiResult<StatusCode> {
    state.engine.fail_workflow_task(req.task_token, req.failure)?;
    Ok(StatusCode::OK)
}

/// Long-poll for an activity task.
///
/// `POST /api/tasks/activity/poll`
pub async fn poll_activity(
    State(state): State<AppState>,
    Json(req): Json<PollRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .poll_activity_task(&req.task_queue, state.poll_timeout())
        .await
    {
        Some(task) => Json::<ActivityTask>(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteActivityRequest {
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Report activity success.
///
/// `POST /api/tasks/activity/complete`
pub async fn complete_activity(
    State(state): State<AppState>,
    Json(req): Json<CompleteActivityRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .complete_activity(req.run_id, &req.activity_id, req.attempt, req.result)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct FailActivityRequest {
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
    pub failure: Failure,
}

/// Report activity failure; the retry policy decides what happens next.
///
/// `POST /api/tasks/activity/fail`
pub async fn fail_activity(
    State(state): State<AppState>,
    Json(req): Json<FailActivityRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .fail_activity(req.run_id, &req.activity_id, req.attempt, req.failure)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// The workflow requested cancellation; the activity should stop.
    pub cancel_requested: bool,
}

/// Record an activity heartbeat.
///
/// `POST /api/tasks/activity/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let cancel_requested = state.engine.record_activity_heartbeat(
        req.run_id,
        &req.activity_id,
        req.attempt,
        req.details,
    )?;
    Ok(Json(HeartbeatResponse { cancel_requested }))
}
