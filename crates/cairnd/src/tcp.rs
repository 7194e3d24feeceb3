//! TCP transport: one connection per stream.
//!
//! The listener opens every connection with a random 32-byte nonce. The
//! dialler answers with a `Preface` frame naming the protocol, its public key
//! and the address it listens on, signed together with the nonce, then waits
//! for a one-byte verdict. Only a preface that verifies updates the address
//! book; the caller's peer id is derived from the key it proved. Address
//! lookups are served by the transport itself on `PEER_LOOKUP_PROTOCOL`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use cairn_core::crypto::{verify_signature, Hasher, Keypair, PeerId};
use cairn_core::wire::{read_frame, write_frame, FrameError, ProtocolId, PEER_LOOKUP_PROTOCOL};
use cairn_services::{BoxStream, StreamHandler, Transport, TransportError};

const ACCEPTED: u8 = 1;
const UNSUPPORTED: u8 = 0;

const PREFACE_TIMEOUT: Duration = Duration::from_secs(10);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

const NONCE_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct Preface {
    protocol: String,
    public_key: [u8; 32],
    listen_addr: String,
    /// Ed25519 over `preface_digest` with the listener's nonce.
    signature: Vec<u8>,
}

impl Preface {
    fn signed(
        keypair: &Keypair,
        nonce: &[u8; NONCE_LEN],
        protocol: &str,
        listen_addr: &str,
    ) -> Self {
        let public_key = keypair.public_key();
        let digest = preface_digest(nonce, protocol, &public_key, listen_addr);
        Self {
            protocol: protocol.to_string(),
            public_key,
            listen_addr: listen_addr.to_string(),
            signature: keypair.sign(&digest).to_vec(),
        }
    }

    /// The caller's peer id, if the signature covers this nonce.
    fn verify(&self, nonce: &[u8; NONCE_LEN]) -> Option<PeerId> {
        let digest = preface_digest(nonce, &self.protocol, &self.public_key, &self.listen_addr);
        verify_signature(&self.public_key, &digest, &self.signature)
            .then(|| PeerId::from_public_key(&self.public_key))
    }
}

fn preface_digest(
    nonce: &[u8; NONCE_LEN],
    protocol: &str,
    public_key: &[u8; 32],
    listen_addr: &str,
) -> [u8; 32] {
    let mut h = Hasher::new();
    h.update(nonce);
    for field in [protocol.as_bytes(), public_key.as_slice(), listen_addr.as_bytes()] {
        h.update(&(field.len() as u64).to_le_bytes());
        h.update(field);
    }
    h.finalize()
}

#[derive(Debug, Serialize, Deserialize)]
struct LookupRequest {
    peer: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
struct LookupResponse {
    address: Option<String>,
}

pub struct TcpTransport {
    keypair: Arc<Keypair>,
    local: PeerId,
    /// Address written into every preface.
    listen_addr: String,
    handlers: DashMap<ProtocolId, Arc<dyn StreamHandler>>,
    address_book: DashMap<PeerId, String>,
}

impl TcpTransport {
    pub fn new(keypair: Arc<Keypair>, listen_addr: String) -> Arc<Self> {
        Arc::new(Self {
            local: keypair.peer_id(),
            keypair,
            listen_addr,
            handlers: DashMap::new(),
            address_book: DashMap::new(),
        })
    }

    /// Accept connections until shutdown. Each connection runs on its own
    /// task.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.serve(stream, remote).await {
                                tracing::debug!(remote = %remote, error = %e, "inbound stream failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("tcp listener stopped");
    }

    async fn serve(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<(), TransportError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        stream.write_all(&nonce).await?;
        let preface: Preface = tokio::time::timeout(PREFACE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no preface"))?
            .map_err(frame_error)?;

        let Some(peer) = preface.verify(&nonce) else {
            tracing::warn!(remote = %remote, "preface signature rejected");
            let denied = io::Error::new(io::ErrorKind::PermissionDenied, "bad preface signature");
            return Err(denied.into());
        };
        if peer != self.local {
            let address = advertised_addr(&preface.listen_addr, remote);
            self.address_book.insert(peer, address);
        }

        if preface.protocol == PEER_LOOKUP_PROTOCOL {
            stream.write_u8(ACCEPTED).await?;
            return self.answer_lookup(&mut stream).await;
        }

        let handler = self
            .handlers
            .get(preface.protocol.as_str())
            .map(|h| h.value().clone());
        let Some(handler) = handler else {
            tracing::debug!(
                peer = %peer.short(),
                protocol = %preface.protocol,
                "no handler for protocol"
            );
            stream.write_u8(UNSUPPORTED).await?;
            return Ok(());
        };
        stream.write_u8(ACCEPTED).await?;
        handler.handle(peer, Box::new(stream)).await;
        Ok(())
    }

    async fn answer_lookup(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let req: LookupRequest = read_frame(stream).await.map_err(frame_error)?;
        let address = if req.peer == self.local {
            Some(self.listen_addr.clone())
        } else {
            self.address_book.get(&req.peer).map(|a| a.value().clone())
        };
        write_frame(stream, &LookupResponse { address })
            .await
            .map_err(frame_error)?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn dial(
        &self,
        peer: PeerId,
        address: &str,
        protocol: ProtocolId,
    ) -> Result<TcpStream, TransportError> {
        let mut stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| TransportError::Unreachable {
                    peer,
                    reason: e.to_string(),
                })?;
        let mut nonce = [0u8; NONCE_LEN];
        tokio::time::timeout(PREFACE_TIMEOUT, stream.read_exact(&mut nonce))
            .await
            .map_err(|_| TransportError::Unreachable {
                peer,
                reason: "no nonce from listener".into(),
            })??;
        let preface = Preface::signed(&self.keypair, &nonce, protocol, &self.listen_addr);
        write_frame(&mut stream, &preface)
            .await
            .map_err(frame_error)?;
        match stream.read_u8().await? {
            ACCEPTED => Ok(stream),
            _ => Err(TransportError::UnsupportedProtocol {
                peer,
                protocol: protocol.to_string(),
            }),
        }
    }

    /// Ask `via` for the address of `target`.
    async fn lookup(&self, via: PeerId, target: PeerId) -> Result<Option<String>, TransportError> {
        let mut stream = self.open_stream(via, PEER_LOOKUP_PROTOCOL).await?;
        write_frame(&mut stream, &LookupRequest { peer: target })
            .await
            .map_err(frame_error)?;
        let resp: LookupResponse = read_frame(&mut stream).await.map_err(frame_error)?;
        Ok(resp.address)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: ProtocolId,
    ) -> Result<BoxStream, TransportError> {
        let address = self
            .address_book
            .get(&peer)
            .map(|a| a.value().clone())
            .ok_or(TransportError::UnknownPeer(peer))?;
        let stream = self.dial(peer, &address, protocol).await?;
        Ok(Box::new(stream))
    }

    fn set_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        self.handlers.insert(protocol, handler);
    }

    fn known_peers(&self) -> Vec<PeerId> {
        self.address_book
            .iter()
            .map(|e| *e.key())
            .filter(|p| *p != self.local)
            .collect()
    }

    fn add_peer_address(&self, peer: PeerId, address: String) {
        if peer != self.local {
            self.address_book.insert(peer, address);
        }
    }

    /// Ask every known peer concurrently; the first address returned wins.
    async fn find_peer(&self, peer: PeerId) -> Result<String, TransportError> {
        if let Some(address) = self.address_book.get(&peer) {
            return Ok(address.value().clone());
        }
        let asks = self.known_peers().into_iter().map(|via| async move {
            match tokio::time::timeout(LOOKUP_TIMEOUT, self.lookup(via, peer)).await {
                Ok(Ok(address)) => address,
                Ok(Err(e)) => {
                    tracing::debug!(via = %via.short(), error = %e, "peer lookup failed");
                    None
                }
                Err(_) => None,
            }
        });
        futures::future::join_all(asks)
            .await
            .into_iter()
            .flatten()
            .next()
            .ok_or(TransportError::NotFound(peer))
    }
}

fn frame_error(e: FrameError) -> TransportError {
    match e {
        FrameError::Io(e) => TransportError::Io(e),
        other => TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
    }
}

/// A caller listening on an unspecified address is reachable on the IP its
/// connection came from.
fn advertised_addr(listen_addr: &str, remote: SocketAddr) -> String {
    match listen_addr.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(remote.ip(), addr.port()).to_string()
        }
        _ => listen_addr.to_string(),
    }
}

/// Parse a bootstrap entry of the form `peer_id_hex@host:port`.
pub fn parse_bootstrap(entry: &str) -> anyhow::Result<(PeerId, String)> {
    let (id, address) = entry
        .split_once('@')
        .with_context(|| format!("bootstrap peer {entry:?} is not peer_id@host:port"))?;
    let peer = id
        .parse::<PeerId>()
        .map_err(|_| anyhow::anyhow!("bootstrap peer {entry:?} has an invalid peer id"))?;
    Ok((peer, address.to_string()))
}
