//! Message envelope: sender identity, timestamp, id and signature carried by
//! every protocol message.
//!
//! A message is `SignedMessage<B>`: an envelope plus a protocol-specific body.
//! The signature covers the bincode encoding of the whole message with the
//! `signature` field empty. Verification rebuilds those bytes, checks that the
//! claimed public key hashes to the claimed sender id, and then checks the
//! signature. Nothing acts on a message before [`SignedMessage::verify`]
//! returns true.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{verify_signature, Keypair, PeerId};

/// Client version stamped into every envelope.
pub const CLIENT_VERSION: &str = "cairn/1.0.0";

/// Metadata attached to every outbound message, request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub client_version: String,
    pub sender_id: PeerId,
    pub sender_public_key: [u8; 32],
    /// Unix seconds.
    pub timestamp: i64,
    /// UUID v4. Responses reuse the id of the request they answer.
    pub message_id: String,
    pub signature: Vec<u8>,
    /// True for flood-forwarded messages, false for direct ones.
    pub gossip: bool,
}

impl MessageEnvelope {
    /// Fresh envelope for this node. The signature is left empty.
    pub fn new(message_id: impl Into<String>, gossip: bool, keypair: &Keypair) -> Self {
        Self {
            client_version: CLIENT_VERSION.to_string(),
            sender_id: keypair.peer_id(),
            sender_public_key: keypair.public_key(),
            timestamp: unix_now(),
            message_id: message_id.into(),
            signature: Vec::new(),
            gossip,
        }
    }
}

/// A new random message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Envelope plus body. This is the unit written to the wire as one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage<B> {
    pub envelope: MessageEnvelope,
    pub body: B,
}

/// Borrowed view with the signature cleared. Encodes identically to a
/// `SignedMessage` whose signature is empty.
#[derive(Serialize)]
struct Unsigned<'a, B> {
    envelope: MessageEnvelope,
    body: &'a B,
}

impl<B: Serialize> SignedMessage<B> {
    /// Build and sign a message from this node.
    pub fn new(
        keypair: &Keypair,
        message_id: impl Into<String>,
        gossip: bool,
        body: B,
    ) -> Result<Self, EnvelopeError> {
        let mut msg = Self {
            envelope: MessageEnvelope::new(message_id, gossip, keypair),
            body,
        };
        msg.envelope.signature = sign(&msg, keypair)?;
        Ok(msg)
    }

    /// Replace the envelope with one from this node and sign again.
    /// Used when relaying: the body is untouched, id and signature change.
    pub fn resign(
        &mut self,
        keypair: &Keypair,
        message_id: impl Into<String>,
    ) -> Result<(), EnvelopeError> {
        self.envelope = MessageEnvelope::new(message_id, self.envelope.gossip, keypair);
        self.envelope.signature = sign(self, keypair)?;
        Ok(())
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut envelope = self.envelope.clone();
        envelope.signature.clear();
        let view = Unsigned {
            envelope,
            body: &self.body,
        };
        Ok(bincode::serialize(&view)?)
    }

    /// Check identity binding and signature. Never errors: any failure is
    /// `false` and the caller drops the message.
    pub fn verify(&self) -> bool {
        let claimed = PeerId::from_public_key(&self.envelope.sender_public_key);
        if claimed != self.envelope.sender_id {
            return false;
        }
        let bytes = match self.signing_bytes() {
            Ok(b) => b,
            Err(_) => return false,
        };
        verify_signature(
            &self.envelope.sender_public_key,
            &bytes,
            &self.envelope.signature,
        )
    }

    pub fn sender(&self) -> PeerId {
        self.envelope.sender_id
    }

    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }
}

/// Sign `message` with `keypair`. The message's own signature is ignored.
pub fn sign<B: Serialize>(
    message: &SignedMessage<B>,
    keypair: &Keypair,
) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = message.signing_bytes()?;
    Ok(keypair.sign(&bytes).to_vec())
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode message for signing: {0}")]
    Encode(#[from] bincode::Error),
}
