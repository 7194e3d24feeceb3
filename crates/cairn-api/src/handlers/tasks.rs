//! /discover and /tasks handlers: finding free nodes and running replicated
//! services across them.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{parse_peers, protocol_error, ApiError, ApiState};

// ── /discover (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DiscoverRequest {
    pub count: usize,
}

#[derive(Serialize)]
pub struct DiscoverResponse {
    pub peers: Vec<String>,
}

pub async fn handle_discover(
    State(state): State<ApiState>,
    Json(req): Json<DiscoverRequest>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let found = state.node.discover(req.count).await.map_err(protocol_error)?;
    Ok(Json(DiscoverResponse {
        peers: found.iter().map(|p| p.to_string()).collect(),
    }))
}

// ── /tasks/run (POST) ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TaskRunRequest {
    /// Service description, passed to the runtime as-is.
    pub spec: serde_json::Value,
    pub peers: Vec<String>,
}

#[derive(Serialize)]
pub struct TaskRunResponse {
    pub service_id: String,
}

pub async fn handle_task_run(
    State(state): State<ApiState>,
    Json(req): Json<TaskRunRequest>,
) -> Result<Json<TaskRunResponse>, ApiError> {
    let peers = parse_peers(&req.peers)?;
    let service_id = state
        .node
        .run_task(&req.spec.to_string(), &peers)
        .await
        .map_err(protocol_error)?;
    Ok(Json(TaskRunResponse { service_id }))
}

// ── /tasks/stop (POST) ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TaskStopRequest {
    pub peers: Vec<String>,
}

#[derive(Serialize)]
pub struct TaskStopResponse {
    pub stopped: bool,
}

pub async fn handle_task_stop(
    State(state): State<ApiState>,
    Json(req): Json<TaskStopRequest>,
) -> Result<Json<TaskStopResponse>, ApiError> {
    let peers = parse_peers(&req.peers)?;
    state.node.stop_task(&peers).await.map_err(protocol_error)?;
    Ok(Json(TaskStopResponse { stopped: true }))
}
