//! /images and /containers handlers: image upload, remote runs and
//! inspection.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{parse_peer, protocol_error, ApiError, ApiState};

// ── /images/push (POST) ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ImagePushRequest {
    pub peer: String,
    /// Path of a local image archive.
    pub path: PathBuf,
}

#[derive(Serialize)]
pub struct ImagePushResponse {
    pub image_id: String,
}

pub async fn handle_image_push(
    State(state): State<ApiState>,
    Json(req): Json<ImagePushRequest>,
) -> Result<Json<ImagePushResponse>, ApiError> {
    let peer = parse_peer(&req.peer)?;
    if !req.path.is_file() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} is not a file", req.path.display()),
        ));
    }
    let image_id = state
        .node
        .push_image(peer, &req.path)
        .await
        .map_err(protocol_error)?;
    Ok(Json(ImagePushResponse { image_id }))
}

// ── /images/run (POST) ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ImageRunRequest {
    pub peer: String,
    pub image_id: String,
}

#[derive(Serialize)]
pub struct ImageRunResponse {
    pub container_id: String,
}

pub async fn handle_image_run(
    State(state): State<ApiState>,
    Json(req): Json<ImageRunRequest>,
) -> Result<Json<ImageRunResponse>, ApiError> {
    let peer = parse_peer(&req.peer)?;
    let container_id = state
        .node
        .run_image(peer, &req.image_id)
        .await
        .map_err(protocol_error)?;
    Ok(Json(ImageRunResponse { container_id }))
}

// ── /images/list (POST) ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ImageListRequest {
    pub peer: String,
    /// Hex public key whose signatures qualify an image. Defaults to ours.
    #[serde(default)]
    pub public_key: Option<String>,
}

pub async fn handle_image_list(
    State(state): State<ApiState>,
    Json(req): Json<ImageListRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let peer = parse_peer(&req.peer)?;
    let public_key = req
        .public_key
        .unwrap_or_else(|| state.node.public_key_hex());
    let raw = state
        .node
        .list_images(peer, &public_key)
        .await
        .map_err(protocol_error)?;
    raw_json(&raw).map(Json)
}

// ── /containers/inspect (POST) ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InspectRequest {
    pub peer: String,
    pub container_id: String,
}

pub async fn handle_inspect(
    State(state): State<ApiState>,
    Json(req): Json<InspectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let peer = parse_peer(&req.peer)?;
    let raw = state
        .node
        .inspect_container(peer, &req.container_id)
        .await
        .map_err(protocol_error)?;
    raw_json(&raw).map(Json)
}

/// Remote JSON is passed through; anything unparsable is the peer's fault.
fn raw_json(raw: &str) -> Result<serde_json::Value, ApiError> {
    serde_json::from_str(raw).map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            format!("peer returned invalid JSON: {e}"),
        )
    })
}
