//! In-process transport. Every node on a `MemoryNetwork` can open streams to
//! every other node whose address it knows; streams are `tokio::io::duplex`
//! pairs. The network-wide registry plays the part of the DHT in
//! `find_peer`, and a node that receives a stream learns the caller's
//! address.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use cairn_core::crypto::PeerId;
use cairn_core::wire::ProtocolId;

use crate::transport::{BoxStream, StreamHandler, Transport, TransportError};

const DUPLEX_CAPACITY: usize = 256 * 1024;

type HandlerTable = Arc<DashMap<ProtocolId, Arc<dyn StreamHandler>>>;
type AddressBook = Arc<DashMap<PeerId, String>>;

struct Endpoint {
    address: String,
    handlers: HandlerTable,
    address_book: AddressBook,
}

/// Shared registry of every node on the in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<PeerId, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the network. Its address book starts empty.
    pub fn join(&self, peer: PeerId) -> Arc<MemoryTransport> {
        let handlers: HandlerTable = Arc::new(DashMap::new());
        let address_book: AddressBook = Arc::new(DashMap::new());
        let address = format!("mem/{}", peer.short());
        self.nodes.insert(
            peer,
            Endpoint {
                address,
                handlers: handlers.clone(),
                address_book: address_book.clone(),
            },
        );
        Arc::new(MemoryTransport {
            local: peer,
            network: self.clone(),
            handlers,
            address_book,
        })
    }

    /// Take a node off the network. Streams to it fail from now on.
    pub fn leave(&self, peer: &PeerId) {
        self.nodes.remove(peer);
    }

    /// Make `a` and `b` know each other's addresses.
    pub fn connect(&self, a: &MemoryTransport, b: &MemoryTransport) {
        a.add_peer_address(b.local, self.address_of(&b.local).unwrap_or_default());
        b.add_peer_address(a.local, self.address_of(&a.local).unwrap_or_default());
    }

    fn address_of(&self, peer: &PeerId) -> Option<String> {
        self.nodes.get(peer).map(|n| n.address.clone())
    }
}

pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
    handlers: HandlerTable,
    address_book: AddressBook,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: ProtocolId,
    ) -> Result<BoxStream, TransportError> {
        if !self.address_book.contains_key(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        let my_address = self.network.address_of(&self.local).unwrap_or_default();
        let handler = {
            let node = self
                .network
                .nodes
                .get(&peer)
                .ok_or_else(|| TransportError::Unreachable {
                    peer,
                    reason: "not on the network".into(),
                })?;
            let handler = node
                .handlers
                .get(protocol)
                .map(|h| h.value().clone())
                .ok_or_else(|| TransportError::UnsupportedProtocol {
                    peer,
                    protocol: protocol.to_string(),
                })?;
            // The callee learns the caller's address, as a real peerstore would.
            node.address_book.insert(self.local, my_address);
            handler
        };

        let (local_end, remote_end) = tokio::io::duplex(DUPLEX_CAPACITY);
        let from = self.local;
        tokio::spawn(async move {
            handler.handle(from, Box::new(remote_end)).await;
        });
        Ok(Box::new(local_end))
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

    async fn find_peer(&self, peer: PeerId) -> Result<String, TransportError> {
        self.network
            .address_of(&peer)
            .ok_or(TransportError::NotFound(peer))
    }
}
