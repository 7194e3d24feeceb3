//! Transport seam: the stream-oriented collaborator every protocol runs on.
//!
//! A transport knows this node's identity, opens one ordered byte stream per
//! `(peer, protocol)` request, dispatches inbound streams to the handler
//! registered for their protocol (each on its own task), keeps an address
//! book, and can resolve an unknown peer's address.
//!
//! Structured messages are one frame per stream: open, write, close. The
//! helpers here are the only place protocols touch framing.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use cairn_core::crypto::PeerId;
use cairn_core::envelope::SignedMessage;
use cairn_core::wire::{read_frame, write_frame, ProtocolId};

use crate::error::ProtocolError;

/// Any ordered, reliable, bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Receives inbound streams for one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// `peer` is the remote end as reported by the transport.
    async fn handle(&self, peer: PeerId, stream: BoxStream);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Open a new outbound stream. The peer must be in the address book.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: ProtocolId,
    ) -> Result<BoxStream, TransportError>;

    /// Register (or replace) the handler for a protocol.
    fn set_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>);

    /// Peers in the address book, never including this node.
    fn known_peers(&self) -> Vec<PeerId>;

    fn add_peer_address(&self, peer: PeerId, address: String);

    /// Resolve a peer's address through the network's lookup service.
    async fn find_peer(&self, peer: PeerId) -> Result<String, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address known for peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },
    #[error("peer {peer} does not serve {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: String },
    #[error("lookup for {0} found nothing")]
    NotFound(PeerId),
    #[error("transport io: {0}")]
    Io(#[from] io::Error),
}

// ── Message helpers ───────────────────────────────────────────────────────────

/// Open a stream to `peer`, write one signed message and close it.
pub async fn send_message<B: Serialize>(
    transport: &dyn Transport,
    peer: PeerId,
    protocol: ProtocolId,
    message: &SignedMessage<B>,
) -> Result<(), ProtocolError> {
    let mut stream = transport.open_stream(peer, protocol).await?;
    write_frame(&mut stream, message).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one signed message from an inbound stream. Verification is left to
/// the caller.
pub async fn read_message<B: DeserializeOwned>(
    stream: &mut BoxStream,
) -> Result<SignedMessage<B>, ProtocolError> {
    Ok(read_frame(stream).await?)
}

/// Fail with `Verification` unless the message's identity binding and
/// signature check out.
pub fn ensure_verified<B: Serialize>(message: &SignedMessage<B>) -> Result<(), ProtocolError> {
    if message.verify() {
        Ok(())
    } else {
        Err(ProtocolError::Verification {
            peer: message.sender(),
            msg_id: message.message_id().to_string(),
        })
    }
}

/// Send to every peer concurrently, one task per peer. Failures are logged
/// and do not affect the other sends. Returns how many sends succeeded.
pub async fn flood<B>(
    transport: Arc<dyn Transport>,
    peers: Vec<PeerId>,
    protocol: ProtocolId,
    message: Arc<SignedMessage<B>>,
) -> usize
where
    B: Serialize + Send + Sync + 'static,
{
    let sends = peers.into_iter().map(|peer| {
        let transport = transport.clone();
        let message = message.clone();
        tokio::spawn(async move {
            match send_message(transport.as_ref(), peer, protocol, &message).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        peer = %peer.short(),
                        msg_id = %message.message_id(),
                        protocol,
                        error = %e,
                        "send failed"
                    );
                    false
                }
            }
        })
    });
    futures::future::join_all(sends)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count()
}

// ── Latched raw writer ────────────────────────────────────────────────────────

/// Raw byte writer whose first error latches.
///
/// After a failed write every later `write_chunk` is a no-op, so a caller can
/// issue the header and every body chunk and check once at the end.
pub struct LatchedWriter<W> {
    inner: W,
    error: Option<io::Error>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> LatchedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            error: None,
            written: 0,
        }
    }

    pub async fn write_chunk(&mut self, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        match self.inner.write_all(bytes).await {
            Ok(()) => self.written += bytes.len() as u64,
            Err(e) => self.error = Some(e),
        }
    }

    /// The latched error, if any write failed.
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// Bytes successfully written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and return the stream, or the latched error.
    pub async fn finish(mut self) -> io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.inner.flush().await?;
        Ok(self.inner)
    }
}
