//! Workflow execution endpoints: start, signal, query, update, cancel,
//! terminate, describe, history, result, list, and count.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use windlass_engine::{
    ExecutionInfo, ExecutionRef, HistoryEvent, ListFilter, Outcome, StartWorkflowRequest,
};

use crate::error::ApiResult;
use crate::state::AppState;

fn default_namespace() -> String {
    "default".to_string()
}

/// Namespace selector common to the per-workflow endpoints.
#[derive(Debug, Deserialize)]
pub struct NamespaceQuery {
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Start a new workflow execution.
///
/// `POST /api/executions`
///
/// Returns `409 Conflict` when the workflow id already has an open run, or
/// when a closed run blocks reuse under the requested id reuse policy.
pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<ExecutionRef>)> {
    let handle = state.engine.start_workflow(req)?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// Describe the current run of a workflow id.
///
/// `GET /api/executions/{workflow_id}`
pub async fn describe(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
) -> ApiResult<Json<ExecutionInfo>> {
    let info = state.engine.describe_execution(&ns.namespace, &workflow_id)?;
    Ok(Json(info))
}

/// Full event history of the current run.
///
/// `GET /api/executions/{workflow_id}/history`
pub async fn history(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
) -> ApiResult<Json<Vec<HistoryEvent>>> {
    let run_id = state.engine.current_run_id(&ns.namespace, &workflow_id)?;
    let events = state.engine.get_history(run_id)?;
    Ok(Json(events))
}

/// Await and return the final result of the execution chain, following
/// continue-as-new to the last run.
///
/// `GET /api/executions/{workflow_id}/result`
pub async fn result(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = state.engine.get_result(&ns.namespace, &workflow_id).await?;
    Ok(Json(json!({"status": "completed", "result": value})))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Deliver a signal to the current run.
///
/// `POST /api/executions/{workflow_id}/signal`
pub async fn signal(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
    Json(req): Json<SignalRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .signal_workflow(&ns.namespace, &workflow_id, &req.signal_name, req.input)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Run a read-only query against the current run.
///
/// `POST /api/executions/{workflow_id}/query`
pub async fn query(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let value =
        state
            .engine
            .query_workflow(&ns.namespace, &workflow_id, &req.query_name, req.args)?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub update_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Send an update and await its outcome. Validation failures reject with
/// `400` before anything lands in history.
///
/// `POST /api/executions/{workflow_id}/update`
pub async fn update(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<Json<Outcome>> {
    let outcome = state
        .engine
        .update_workflow(&ns.namespace, &workflow_id, &req.update_name, req.input)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: String,
}

/// Request cooperative cancellation of the current run and its open
/// children.
///
/// `POST /api/executions/{workflow_id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .cancel_workflow(&ns.namespace, &workflow_id, &req.reason)?;
    Ok(StatusCode::ACCEPTED)
}

/// Forcibly close the current run.
///
/// `POST /api/executions/{workflow_id}/terminate`
pub async fn terminate(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(ns): Query<NamespaceQuery>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .terminate_workflow(&ns.namespace, &workflow_id, &req.reason)?;
    Ok(StatusCode::OK)
}

/// Visibility list filter as query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub status: Option<String>,
    pub workflow_type: Option<String>,
    /// `WorkflowId STARTS_WITH` filter
    pub workflow_id_prefix: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> ListFilter {
        ListFilter {
            namespace: self.namespace,
            status: self.status.as_deref().map(Into::into),
            workflow_type: self.workflow_type,
            workflow_id_prefix: self.workflow_id_prefix,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub executions: Vec<ExecutionInfo>,
}

/// List executions matching the filter, newest first.
///
/// `GET /api/executions`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<ListResponse> {
    let executions = state.engine.list_executions(&query.into_filter());
    Json(ListResponse { executions })
}

/// Count executions matching the filter.
///
/// `GET /api/executions/count`
pub async fn count(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let count = state.engine.count_executions(&query.into_filter());
    Json(json!({"count": count}))
}
