//! Protocol bodies: one enum per protocol id.
//!
//! Each body travels inside a `SignedMessage`. Variants are append-only:
//! bincode encodes the variant index, so reordering or removing a variant
//! breaks every node on the same protocol version.

use serde::{Deserialize, Serialize};

use crate::crypto::PeerId;

/// Tagged outcome carried back to a remote caller. Errors are strings
/// because the failing collaborator lives on another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteResult<T> {
    Ok(T),
    Err(String),
}

impl<T> RemoteResult<T> {
    pub fn into_result(self) -> Result<T, String> {
        match self {
            RemoteResult::Ok(v) => Ok(v),
            RemoteResult::Err(e) => Err(e),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for RemoteResult<T> {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(v) => RemoteResult::Ok(v),
            Err(e) => RemoteResult::Err(format!("{e:#}")),
        }
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Flooded request. Only the envelope changes from hop to hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Hex BLAKE3 of the first request; the session id.
    pub init_hash: String,
    pub init_node_id: PeerId,
    pub ttl_secs: u64,
    /// Unix seconds after which the request is dropped everywhere.
    pub expiry: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    Request(DiscoveryRequest),
    Response { init_hash: String },
}

// ── Swarm join / leave ────────────────────────────────────────────────────────

/// All messages of one handshake carry the id of its `JoinRequest`
/// (or `LeaveRequest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwarmMessage {
    JoinRequest,
    JoinAccepted,
    JoinToken { token: String, address: String },
    Joined,
    LeaveRequest,
    LeaveAccepted,
}

impl SwarmMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmMessage::JoinRequest => "join_request",
            SwarmMessage::JoinAccepted => "join_accepted",
            SwarmMessage::JoinToken { .. } => "join_token",
            SwarmMessage::Joined => "joined",
            SwarmMessage::LeaveRequest => "leave_request",
            SwarmMessage::LeaveAccepted => "leave_accepted",
        }
    }
}

// ── Task execution ────────────────────────────────────────────────────────────

/// Responses reuse the request's message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskMessage {
    RunRequest { image_id: String },
    RunResponse { result: RemoteResult<String> },
    InspectRequest { container_id: String },
    InspectResponse { result: RemoteResult<String> },
    /// `public_key` is hex Ed25519.
    ListImagesRequest { public_key: String },
    ListImagesResponse { result: RemoteResult<String> },
}

impl TaskMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskMessage::RunRequest { .. } => "run_request",
            TaskMessage::RunResponse { .. } => "run_response",
            TaskMessage::InspectRequest { .. } => "inspect_request",
            TaskMessage::InspectResponse { .. } => "inspect_response",
            TaskMessage::ListImagesRequest { .. } => "list_images_request",
            TaskMessage::ListImagesResponse { .. } => "list_images_response",
        }
    }
}

// ── Transfer ──────────────────────────────────────────────────────────────────

/// Sent on the upload-reply protocol once an upload has been processed.
/// `result` carries the image id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReply {
    pub content_hash: String,
    pub result: RemoteResult<String>,
}
