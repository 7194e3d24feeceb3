//! Error type shared by every protocol in this crate.

use cairn_core::crypto::PeerId;
use cairn_core::envelope::EnvelopeError;
use cairn_core::framing::HeaderError;
use cairn_core::wire::FrameError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("message {msg_id} from {peer} failed verification")]
    Verification { peer: PeerId, msg_id: String },
    #[error("no request {msg_id} in flight for {peer}")]
    UnknownRequest { peer: PeerId, msg_id: String },
    #[error("unexpected {kind} message on {protocol}")]
    Unexpected {
        protocol: &'static str,
        kind: &'static str,
    },
    #[error("discovery timed out with {found} of {wanted} answers")]
    DiscoveryTimedOut { wanted: usize, found: usize },
    #[error("swarm join timed out with {joined} of {wanted} peers joined")]
    JoinTimedOut { wanted: usize, joined: usize },
    #[error("swarm leave timed out with {left} of {wanted} peers released")]
    LeaveTimedOut { wanted: usize, left: usize },
    #[error("asked for {requested} replicas but only {available} peers are available")]
    InvalidReplicaCount { requested: usize, available: usize },
    #[error("reached {reached} of {wanted} peers")]
    NotEnoughPeers { wanted: usize, reached: usize },
    #[error("invalid task spec: {0}")]
    InvalidTaskSpec(String),
    #[error("{0} timed out")]
    TimedOut(&'static str),
    #[error("invalid upload header: {0}")]
    InvalidHeader(String),
    #[error("content hash mismatch: header says {expected}, body is {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("runtime error: {0:#}")]
    Runtime(#[from] anyhow::Error),
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
