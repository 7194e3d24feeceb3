//! /status, /peers, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub peer_id: String,
    pub public_key: String,
    pub known_peers: usize,
    pub running_jobs: usize,
    pub busy: bool,
    pub pending_discovery: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_service: Option<String>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    let jobs = node.task().jobs();
    Json(StatusResponse {
        peer_id: node.peer_id().to_string(),
        public_key: node.public_key_hex(),
        known_peers: node.known_peers().len(),
        running_jobs: jobs.len().await,
        busy: jobs.is_busy().await,
        pending_discovery: node.discovery().pending_len().await,
        deployed_service: node.deployed_service().await,
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<String>,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let peers = state
        .node
        .known_peers()
        .iter()
        .map(|p| p.to_string())
        .collect();
    Json(PeersResponse { peers })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
