//! Discovery protocol: gossip-flood node discovery.
//!
//! A session starts at the initiator with a flooded `Request` whose
//! `init_hash` is the session id. Each relay handles a session at most once:
//!
//! ```text
//! relay:      Unseen → Seen(cached until expiry) → Expired(swept)
//! initiator:  Started → Collecting(0..n) → Satisfied(n) | TimedOut
//! ```
//!
//! A relay forwards to every neighbour except the one it heard from, learns
//! the originator's address if it is not a direct neighbour, and answers
//! directly unless it is busy. Busy relays park the request in a bounded
//! pending cache and answer it once the task protocol reports them free.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};

use cairn_core::config::DiscoveryConfig;
use cairn_core::crypto::{hash, Keypair, PeerId};
use cairn_core::envelope::{new_message_id, unix_now, SignedMessage};
use cairn_core::message::{DiscoveryMessage, DiscoveryRequest};
use cairn_core::wire::DISCOVERY_PROTOCOL;

use crate::error::ProtocolError;
use crate::observer::Observer;
use crate::task::RunningJobs;
use crate::transport::{
    ensure_verified, flood, read_message, send_message, BoxStream, StreamHandler, Transport,
};

/// A request this node owes an answer to but could not send while busy.
#[derive(Debug, Clone)]
struct PendingResponse {
    init_hash: String,
    originator: PeerId,
    /// Id of the request as it reached this node; the response reuses it.
    msg_id: String,
    expiry: i64,
}

#[derive(Clone)]
pub struct Discovery {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    jobs: RunningJobs,
    config: DiscoveryConfig,
    /// init_hash → expiry (unix secs)
    received: Arc<DashMap<String, i64>>,
    pending: Arc<Mutex<Vec<PendingResponse>>>,
    /// init_hash → channel of the local session collecting answers
    sessions: Arc<DashMap<String, mpsc::Sender<PeerId>>>,
}

/// Initiator side of one discovery session.
pub struct DiscoverySession {
    pub init_hash: String,
    pub init_node_id: PeerId,
    pub ttl_secs: u64,
    pub expiry: i64,
    wanted: usize,
    rx: mpsc::Receiver<PeerId>,
    sessions: Arc<DashMap<String, mpsc::Sender<PeerId>>>,
}

impl DiscoverySession {
    /// Wait for `wanted` distinct answers. On timeout the session is torn
    /// down and the error reports how many arrived.
    pub async fn collect(mut self, timeout: Duration) -> Result<Vec<PeerId>, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut found: Vec<PeerId> = Vec::with_capacity(self.wanted);
        while found.len() < self.wanted {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(peer)) => {
                    if !found.contains(&peer) {
                        found.push(peer);
                    }
                }
                Ok(None) | Err(_) => {
                    tracing::info!(
                        init_hash = %short_hash(&self.init_hash),
                        wanted = self.wanted,
                        found = found.len(),
                        "discovery timed out"
                    );
                    return Err(ProtocolError::DiscoveryTimedOut {
                        wanted: self.wanted,
                        found: found.len(),
                    });
                }
            }
        }
        Ok(found)
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.sessions.remove(&self.init_hash);
    }
}

impl Discovery {
    pub fn new(
        keypair: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        jobs: RunningJobs,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            keypair,
            transport,
            jobs,
            config,
            received: Arc::new(DashMap::new()),
            pending: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Start a session looking for `n` free nodes and flood the first
    /// request to every known peer.
    pub async fn initiate(&self, n: usize) -> Result<DiscoverySession, ProtocolError> {
        let local = self.keypair.peer_id();
        let msg_id = new_message_id();
        let ttl_secs = self.config.ttl().as_secs();
        let expiry = unix_now() + ttl_secs as i64;
        let init_hash = session_hash(&msg_id, &local, ttl_secs, expiry)?;

        // Our own echo must be dropped like any other duplicate.
        self.received.insert(init_hash.clone(), expiry);
        let (tx, rx) = mpsc::channel(n.max(1));
        self.sessions.insert(init_hash.clone(), tx);
        let session = DiscoverySession {
            init_hash: init_hash.clone(),
            init_node_id: local,
            ttl_secs,
            expiry,
            wanted: n,
            rx,
            sessions: self.sessions.clone(),
        };

        let request = DiscoveryRequest {
            init_hash: init_hash.clone(),
            init_node_id: local,
            ttl_secs,
            expiry,
        };
        let msg = SignedMessage::new(
            &self.keypair,
            msg_id,
            true,
            DiscoveryMessage::Request(request),
        )?;
        let peers = self.transport.known_peers();
        let reached = flood(
            self.transport.clone(),
            peers.clone(),
            DISCOVERY_PROTOCOL,
            Arc::new(msg),
        )
        .await;
        tracing::info!(
            init_hash = %short_hash(&init_hash),
            wanted = n,
            neighbours = peers.len(),
            reached,
            "discovery started"
        );
        Ok(session)
    }

    /// Handle a flooded request that arrived from `from`.
    pub async fn on_request(
        &self,
        msg: SignedMessage<DiscoveryMessage>,
        from: PeerId,
    ) -> Result<(), ProtocolError> {
        let DiscoveryMessage::Request(request) = &msg.body else {
            return Err(ProtocolError::Unexpected {
                protocol: DISCOVERY_PROTOCOL,
                kind: "response",
            });
        };
        let request = request.clone();

        if unix_now() > request.expiry {
            tracing::debug!(init_hash = %short_hash(&request.init_hash), "expired request dropped");
            return Ok(());
        }
        match self.received.entry(request.init_hash.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(init_hash = %short_hash(&request.init_hash), "duplicate request dropped");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(request.expiry);
            }
        }

        ensure_verified(&msg)?;
        let msg_id = msg.message_id().to_string();
        let local = self.keypair.peer_id();

        // Forward with a fresh id and our signature.
        let mut forward = msg;
        forward.resign(&self.keypair, new_message_id())?;
        let targets: Vec<PeerId> = self
            .transport
            .known_peers()
            .into_iter()
            .filter(|p| *p != from && *p != local)
            .collect();
        if !targets.is_empty() {
            let transport = self.transport.clone();
            tokio::spawn(flood(
                transport,
                targets,
                DISCOVERY_PROTOCOL,
                Arc::new(forward),
            ));
        }

        let originator = request.init_node_id;
        if originator == local {
            return Ok(());
        }
        if originator != from && !self.transport.known_peers().contains(&originator) {
            match self.transport.find_peer(originator).await {
                Ok(address) => self.transport.add_peer_address(originator, address),
                Err(e) => tracing::warn!(
                    peer = %originator.short(),
                    error = %e,
                    "could not resolve discovery originator"
                ),
            }
        }

        let pending = PendingResponse {
            init_hash: request.init_hash,
            originator,
            msg_id,
            expiry: request.expiry,
        };
        // Busy is checked under the pending lock so a job ending in between
        // cannot run `retry_pending` before this entry is parked.
        let mut parked = self.pending.lock().await;
        if self.jobs.is_busy().await {
            self.park(&mut parked, pending);
            return Ok(());
        }
        drop(parked);
        self.respond(&pending).await
    }

    fn park(&self, pending: &mut Vec<PendingResponse>, entry: PendingResponse) {
        if pending.len() >= self.config.pending_capacity {
            tracing::info!(
                init_hash = %short_hash(&entry.init_hash),
                capacity = self.config.pending_capacity,
                "busy and pending cache full, request not cached"
            );
            return;
        }
        tracing::debug!(init_hash = %short_hash(&entry.init_hash), "busy, request parked");
        pending.push(entry);
    }

    async fn respond(&self, entry: &PendingResponse) -> Result<(), ProtocolError> {
        let body = DiscoveryMessage::Response {
            init_hash: entry.init_hash.clone(),
        };
        let msg = SignedMessage::new(&self.keypair, entry.msg_id.clone(), false, body)?;
        send_message(
            self.transport.as_ref(),
            entry.originator,
            DISCOVERY_PROTOCOL,
            &msg,
        )
        .await?;
        tracing::debug!(
            peer = %entry.originator.short(),
            init_hash = %short_hash(&entry.init_hash),
            "discovery answered"
        );
        Ok(())
    }

    /// Answer parked requests once no job is running. Expired entries are
    /// dropped; entries whose answer fails to send stay parked.
    pub async fn retry_pending(&self) {
        if self.jobs.is_busy().await {
            return;
        }
        let parked: Vec<PendingResponse> = std::mem::take(&mut *self.pending.lock().await);
        if parked.is_empty() {
            return;
        }
        let now = unix_now();
        let mut failed = Vec::new();
        for entry in parked {
            if now > entry.expiry {
                continue;
            }
            if let Err(e) = self.respond(&entry).await {
                tracing::warn!(
                    peer = %entry.originator.short(),
                    msg_id = %entry.msg_id,
                    error = %e,
                    "pending discovery answer failed"
                );
                failed.push(entry);
            }
        }
        if !failed.is_empty() {
            let mut pending = self.pending.lock().await;
            for entry in failed {
                if pending.len() < self.config.pending_capacity {
                    pending.push(entry);
                }
            }
        }
    }

    /// Route an answer to the local session it belongs to.
    pub async fn on_response(
        &self,
        msg: SignedMessage<DiscoveryMessage>,
    ) -> Result<(), ProtocolError> {
        ensure_verified(&msg)?;
        let DiscoveryMessage::Response { init_hash } = &msg.body else {
            return Err(ProtocolError::Unexpected {
                protocol: DISCOVERY_PROTOCOL,
                kind: "request",
            });
        };
        let sender = msg.sender();
        match self.sessions.get(init_hash) {
            Some(tx) => {
                // A full channel means the session already has its answers.
                let _ = tx.try_send(sender);
            }
            None => tracing::debug!(
                peer = %sender.short(),
                init_hash = %short_hash(init_hash),
                "answer for unknown session dropped"
            ),
        }
        Ok(())
    }

    /// Purge expired sessions from both caches.
    pub async fn sweep(&self) {
        let now = unix_now();
        self.received.retain(|_, expiry| *expiry >= now);
        self.pending.lock().await.retain(|p| p.expiry >= now);
    }

    pub async fn run_sweeper(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    pub fn is_cached(&self, init_hash: &str) -> bool {
        self.received.contains_key(init_hash)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Observer for Discovery {
    fn on_notify(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.retry_pending().await });
    }
}

#[async_trait]
impl StreamHandler for Discovery {
    async fn handle(&self, peer: PeerId, mut stream: BoxStream) {
        let msg = match read_message::<DiscoveryMessage>(&mut stream).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    peer = %peer.short(),
                    error = %e,
                    "dropping undecodable discovery message"
                );
                return;
            }
        };
        let msg_id = msg.message_id().to_string();
        let result = match msg.body {
            DiscoveryMessage::Request(_) => self.on_request(msg, peer).await,
            DiscoveryMessage::Response { .. } => self.on_response(msg).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                peer = %peer.short(),
                msg_id = %msg_id,
                error = %e,
                "discovery message dropped"
            );
        }
    }
}

/// Session id: hex BLAKE3 over the unsigned first request.
fn session_hash(
    msg_id: &str,
    init_node_id: &PeerId,
    ttl_secs: u64,
    expiry: i64,
) -> Result<String, ProtocolError> {
    #[derive(Serialize)]
    struct Unsigned<'a> {
        msg_id: &'a str,
        init_node_id: &'a PeerId,
        ttl_secs: u64,
        expiry: i64,
    }
    let bytes = bincode::serialize(&Unsigned {
        msg_id,
        init_node_id,
        ttl_secs,
        expiry,
    })
    .map_err(cairn_core::envelope::EnvelopeError::from)?;
    Ok(hex::encode(hash(&bytes)))
}

fn short_hash(h: &str) -> &str {
    &h[..16.min(h.len())]
}
