//! HTTP API handlers: exposes node operations as JSON.

pub mod images;
pub mod status;
pub mod tasks;

use axum::http::StatusCode;

use cairn_core::crypto::PeerId;
use cairn_services::{Node, ProtocolError};

#[derive(Clone)]
pub struct ApiState {
    pub node: Node,
    /// Shutdown broadcast sender: signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

/// Parse a hex-encoded peer id.
fn parse_peer(hex_str: &str) -> Result<PeerId, ApiError> {
    hex_str
        .parse::<PeerId>()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid peer id {hex_str:?}")))
}

fn parse_peers(list: &[String]) -> Result<Vec<PeerId>, ApiError> {
    list.iter().map(|p| parse_peer(p)).collect()
}

/// Map a protocol failure onto an HTTP status.
fn protocol_error(e: ProtocolError) -> ApiError {
    let status = match &e {
        ProtocolError::InvalidTaskSpec(_) | ProtocolError::InvalidReplicaCount { .. } => {
            StatusCode::BAD_REQUEST
        }
        ProtocolError::TimedOut(_)
        | ProtocolError::DiscoveryTimedOut { .. }
        | ProtocolError::JoinTimedOut { .. }
        | ProtocolError::LeaveTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProtocolError::Transport(_)
        | ProtocolError::Remote(_)
        | ProtocolError::NotEnoughPeers { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use images::{handle_image_list, handle_image_push, handle_image_run, handle_inspect};
pub use status::{handle_peers, handle_shutdown, handle_status};
pub use tasks::{handle_discover, handle_task_run, handle_task_stop};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        let (status, body) = protocol_error(ProtocolError::DiscoveryTimedOut {
            wanted: 3,
            found: 1,
        });
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body.contains("1 of 3"));
    }

    #[test]
    fn bad_input_maps_to_bad_request() {
        let (status, _) = protocol_error(ProtocolError::InvalidTaskSpec("no name".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse_peer("zz").unwrap_err().0, StatusCode::BAD_REQUEST);
    }
}
