//! cairn-core: identity, signed envelopes, wire framing, upload header
//! and configuration. All other Cairn crates depend on this one.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod framing;
pub mod message;
pub mod wire;

pub use crypto::{Keypair, PeerId};
pub use envelope::{MessageEnvelope, SignedMessage};
pub use message::{DiscoveryMessage, RemoteResult, SwarmMessage, TaskMessage, TransferReply};
