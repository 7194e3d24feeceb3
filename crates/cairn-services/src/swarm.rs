//! Swarm-join coordination: recruiting free peers into this node's cluster
//! and releasing them again.
//!
//! One message id carries a whole handshake; every reply reuses it.
//!
//! ```text
//! initiator:  JoinRequest ──▶            recruit (not a member)
//!                         ◀── JoinAccepted
//!             JoinToken   ──▶            join_cluster(token, address)
//!                         ◀── Joined
//! ```
//!
//! Recruits that are already cluster members stay silent and are never
//! counted. The initiator hands out at most `replica_count` tokens; later
//! acceptances are dropped. A recruit forgets an acceptance once the join
//! timeout passes without a token. Leaving is a single LeaveRequest /
//! LeaveAccepted exchange.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use cairn_core::config::SwarmConfig;
use cairn_core::crypto::{Keypair, PeerId};
use cairn_core::envelope::{new_message_id, SignedMessage};
use cairn_core::message::SwarmMessage;
use cairn_core::wire::SWARM_PROTOCOL;

use crate::error::ProtocolError;
use crate::runtime::{ClusterRole, ContainerRuntime};
use crate::transport::{
    ensure_verified, read_message, send_message, BoxStream, StreamHandler, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    JoinRequested,
    TokenSent,
    LeaveRequested,
}

/// One outstanding handshake on the initiator side.
struct InFlight {
    peer: PeerId,
    stage: Stage,
    done: mpsc::Sender<PeerId>,
    /// Tokens this exchange may still hand out. Shared by its handshakes.
    slots: Arc<AtomicUsize>,
}

/// Recruit side: an initiator this node agreed to join.
struct Accepted {
    initiator: PeerId,
    expires: Instant,
}

/// How an exchange fell short.
struct Shortfall {
    wanted: usize,
    done: usize,
    /// No handshake was left to wait for.
    closed: bool,
}

#[derive(Clone)]
pub struct Swarm {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn ContainerRuntime>,
    config: SwarmConfig,
    /// message id → initiator-side handshake
    in_flight: Arc<DashMap<String, InFlight>>,
    /// message id → initiator this node agreed to join
    accepted: Arc<DashMap<String, Accepted>>,
}

impl Swarm {
    pub fn new(
        keypair: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn ContainerRuntime>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            keypair,
            transport,
            runtime,
            config,
            in_flight: Arc::new(DashMap::new()),
            accepted: Arc::new(DashMap::new()),
        }
    }

    /// Ask every peer to join and wait until `replica_count` of them have.
    /// Returns the peers that completed the handshake.
    pub async fn recruit_and_wait(
        &self,
        peers: &[PeerId],
        replica_count: usize,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, ProtocolError> {
        let local = self.keypair.peer_id();
        let candidates: Vec<PeerId> = peers.iter().copied().filter(|p| *p != local).collect();
        if replica_count > candidates.len() {
            return Err(ProtocolError::InvalidReplicaCount {
                requested: replica_count,
                available: candidates.len(),
            });
        }
        if replica_count == 0 {
            return Ok(Vec::new());
        }
        tracing::info!(
            candidates = candidates.len(),
            replica_count,
            "recruiting peers"
        );
        self.exchange(
            &candidates,
            replica_count,
            timeout,
            Stage::JoinRequested,
            || SwarmMessage::JoinRequest,
        )
        .await
        .map_err(|short| {
            if short.closed {
                ProtocolError::NotEnoughPeers {
                    wanted: short.wanted,
                    reached: short.done,
                }
            } else {
                ProtocolError::JoinTimedOut {
                    wanted: short.wanted,
                    joined: short.done,
                }
            }
        })
    }

    /// Ask every peer to leave the cluster and wait for all of them.
    pub async fn release_and_wait(
        &self,
        peers: &[PeerId],
        timeout: Duration,
    ) -> Result<Vec<PeerId>, ProtocolError> {
        let local = self.keypair.peer_id();
        let members: Vec<PeerId> = peers.iter().copied().filter(|p| *p != local).collect();
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let wanted = members.len();
        self.exchange(
            &members,
            wanted,
            timeout,
            Stage::LeaveRequested,
            || SwarmMessage::LeaveRequest,
        )
        .await
        .map_err(|short| ProtocolError::LeaveTimedOut {
            wanted: short.wanted,
            left: short.done,
        })
    }

    /// Send the opening message to each peer concurrently and collect
    /// `wanted` completions.
    async fn exchange(
        &self,
        peers: &[PeerId],
        wanted: usize,
        timeout: Duration,
        stage: Stage,
        body: impl Fn() -> SwarmMessage,
    ) -> Result<Vec<PeerId>, Shortfall> {
        let (tx, mut rx) = mpsc::channel(peers.len().max(1));
        let slots = Arc::new(AtomicUsize::new(wanted));
        let mut ids = Vec::with_capacity(peers.len());
        let mut sends = Vec::with_capacity(peers.len());
        for &peer in peers {
            let msg_id = new_message_id();
            self.in_flight.insert(
                msg_id.clone(),
                InFlight {
                    peer,
                    stage,
                    done: tx.clone(),
                    slots: slots.clone(),
                },
            );
            ids.push(msg_id.clone());
            let this = self.clone();
            let body = body();
            sends.push(async move {
                let sent = match SignedMessage::new(&this.keypair, msg_id.clone(), false, body) {
                    Ok(msg) => {
                        send_message(this.transport.as_ref(), peer, SWARM_PROTOCOL, &msg).await
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    this.in_flight.remove(&msg_id);
                    tracing::warn!(
                        peer = %peer.short(),
                        msg_id = %msg_id,
                        error = %e,
                        "swarm request not sent"
                    );
                    return false;
                }
                true
            });
        }
        // Only in-flight entries hold senders from here on.
        drop(tx);
        let reached = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut done = Vec::with_capacity(wanted);
        let outcome = loop {
            if done.len() >= wanted {
                break Ok(());
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(peer)) => done.push(peer),
                // Every handshake ended without enough completions.
                Ok(None) => break Err(true),
                Err(_) => break Err(false),
            }
        };
        for id in &ids {
            self.in_flight.remove(id);
        }
        match outcome {
            Ok(()) => {
                tracing::info!(peers = done.len(), ?stage, "swarm exchange complete");
                Ok(done)
            }
            Err(closed) => {
                tracing::warn!(
                    wanted,
                    done = done.len(),
                    reached,
                    ?stage,
                    "swarm exchange incomplete"
                );
                Err(Shortfall {
                    wanted,
                    done: done.len(),
                    closed,
                })
            }
        }
    }

    async fn reply(
        &self,
        peer: PeerId,
        msg_id: &str,
        body: SwarmMessage,
    ) -> Result<(), ProtocolError> {
        let msg = SignedMessage::new(&self.keypair, msg_id, false, body)?;
        send_message(self.transport.as_ref(), peer, SWARM_PROTOCOL, &msg).await
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    async fn dispatch(&self, msg: SignedMessage<SwarmMessage>) -> Result<(), ProtocolError> {
        ensure_verified(&msg)?;
        let sender = msg.sender();
        let msg_id = msg.envelope.message_id;
        match msg.body {
            SwarmMessage::JoinRequest => self.on_join_request(sender, &msg_id).await,
            SwarmMessage::JoinAccepted => self.on_join_accepted(sender, &msg_id).await,
            SwarmMessage::JoinToken { token, address } => {
                self.on_join_token(sender, &msg_id, &token, &address).await
            }
            SwarmMessage::Joined => self.complete(sender, &msg_id, Stage::TokenSent),
            SwarmMessage::LeaveRequest => self.on_leave_request(sender, &msg_id).await,
            SwarmMessage::LeaveAccepted => self.complete(sender, &msg_id, Stage::LeaveRequested),
        }
    }

    async fn on_join_request(&self, sender: PeerId, msg_id: &str) -> Result<(), ProtocolError> {
        if self.runtime.is_cluster_member().await? {
            tracing::debug!(peer = %sender.short(), msg_id, "already in a cluster, not joining");
            return Ok(());
        }
        self.sweep();
        // Recorded before replying: the token can arrive before `reply` returns.
        self.accepted.insert(
            msg_id.to_string(),
            Accepted {
                initiator: sender,
                expires: Instant::now() + self.config.join_timeout(),
            },
        );
        if let Err(e) = self.reply(sender, msg_id, SwarmMessage::JoinAccepted).await {
            self.accepted.remove(msg_id);
            return Err(e);
        }
        Ok(())
    }

    async fn on_join_accepted(&self, sender: PeerId, msg_id: &str) -> Result<(), ProtocolError> {
        let expected = self
            .in_flight
            .get(msg_id)
            .map(|f| f.peer == sender && f.stage == Stage::JoinRequested)
            .unwrap_or(false);
        if !expected {
            return Err(ProtocolError::UnknownRequest {
                peer: sender,
                msg_id: msg_id.to_string(),
            });
        }
        let Some(slots) = self.claim_slot(msg_id) else {
            self.in_flight.remove(msg_id);
            tracing::debug!(peer = %sender.short(), msg_id, "enough recruits, no token sent");
            return Ok(());
        };

        let credentials = async {
            let token = self.runtime.join_token(ClusterRole::Worker).await?;
            let address = self.runtime.cluster_address().await?;
            anyhow::Ok((token, address))
        }
        .await;
        let (token, address) = match credentials {
            Ok(c) => c,
            Err(e) => {
                self.in_flight.remove(msg_id);
                slots.fetch_add(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        // Advance before sending so a fast Joined finds the right stage.
        if let Some(mut entry) = self.in_flight.get_mut(msg_id) {
            entry.stage = Stage::TokenSent;
        }
        let body = SwarmMessage::JoinToken { token, address };
        if let Err(e) = self.reply(sender, msg_id, body).await {
            self.in_flight.remove(msg_id);
            slots.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Take one token slot of the exchange `msg_id` belongs to. Returns the
    /// shared counter so a failed send can give the slot back.
    fn claim_slot(&self, msg_id: &str) -> Option<Arc<AtomicUsize>> {
        let slots = self.in_flight.get(msg_id)?.slots.clone();
        slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| slots)
    }

    async fn on_join_token(
        &self,
        sender: PeerId,
        msg_id: &str,
        token: &str,
        address: &str,
    ) -> Result<(), ProtocolError> {
        if self
            .accepted
            .remove_if(msg_id, |_, a| a.initiator == sender && a.expires > Instant::now())
            .is_none()
        {
            return Err(ProtocolError::UnknownRequest {
                peer: sender,
                msg_id: msg_id.to_string(),
            });
        }
        self.runtime.join_cluster(token, address).await?;
        tracing::info!(peer = %sender.short(), msg_id, address, "joined cluster");
        self.reply(sender, msg_id, SwarmMessage::Joined).await
    }

    async fn on_leave_request(&self, sender: PeerId, msg_id: &str) -> Result<(), ProtocolError> {
        if !self.runtime.is_cluster_member().await? {
            tracing::debug!(peer = %sender.short(), msg_id, "not in a cluster, nothing to leave");
            return Ok(());
        }
        self.runtime.leave_cluster().await?;
        tracing::info!(peer = %sender.short(), msg_id, "left cluster");
        self.reply(sender, msg_id, SwarmMessage::LeaveAccepted).await
    }

    /// Final reply of a handshake: release the entry and signal its waiter.
    fn complete(&self, sender: PeerId, msg_id: &str, stage: Stage) -> Result<(), ProtocolError> {
        match self
            .in_flight
            .remove_if(msg_id, |_, f| f.peer == sender && f.stage == stage)
        {
            Some((_, flight)) => {
                let _ = flight.done.try_send(sender);
                Ok(())
            }
            None => Err(ProtocolError::UnknownRequest {
                peer: sender,
                msg_id: msg_id.to_string(),
            }),
        }
    }

    /// Forget acceptances whose token never came.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.accepted.retain(|_, a| a.expires > now);
    }

    pub async fn run_sweeper(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.join_timeout().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                _ = shutdown.recv() => break,
            }
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }
}

#[async_trait]
impl StreamHandler for Swarm {
    async fn handle(&self, peer: PeerId, mut stream: BoxStream) {
        let msg = match read_message::<SwarmMessage>(&mut stream).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    peer = %peer.short(),
                    error = %e,
                    "dropping undecodable swarm message"
                );
                return;
            }
        };
        let msg_id = msg.message_id().to_string();
        let kind = msg.body.kind();
        if let Err(e) = self.dispatch(msg).await {
            if matches!(e, ProtocolError::UnknownRequest { .. }) {
                tracing::error!(
                    peer = %peer.short(),
                    msg_id = %msg_id,
                    kind,
                    error = %e,
                    "swarm protocol violation"
                );
            } else {
                tracing::warn!(
                    peer = %peer.short(),
                    msg_id = %msg_id,
                    kind,
                    error = %e,
                    "swarm handshake aborted"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::testing::{Collector, FakeRuntime, FAKE_CLUSTER_ADDRESS};

    struct Member {
        id: PeerId,
        swarm: Swarm,
        runtime: Arc<FakeRuntime>,
        transport: Arc<MemoryTransport>,
    }

    fn member(net: &MemoryNetwork) -> Member {
        let keypair = Arc::new(Keypair::generate());
        let id = keypair.peer_id();
        let transport = net.join(id);
        let runtime = Arc::new(FakeRuntime::new());
        let config = SwarmConfig {
            join_timeout_secs: 1,
        };
        let swarm = Swarm::new(keypair, transport.clone(), runtime.clone(), config);
        transport.set_handler(SWARM_PROTOCOL, Arc::new(swarm.clone()));
        Member {
            id,
            swarm,
            runtime,
            transport,
        }
    }

    fn cluster(n: usize) -> (MemoryNetwork, Vec<Member>) {
        let net = MemoryNetwork::new();
        let members: Vec<Member> = (0..n).map(|_| member(&net)).collect();
        for i in 1..n {
            net.connect(&members[0].transport, &members[i].transport);
        }
        members[0].runtime.set_cluster_member(true);
        (net, members)
    }

    #[tokio::test]
    async fn free_recruits_join_and_busy_ones_are_not_counted() {
        let (_net, m) = cluster(4);
        m[3].runtime.set_cluster_member(true);
        let peers: Vec<PeerId> = m.iter().map(|x| x.id).collect();

        let mut joined = m[0]
            .swarm
            .recruit_and_wait(&peers, 2, Duration::from_secs(2))
            .await
            .unwrap();
        joined.sort_by_key(|p| *p.as_bytes());
        let mut expected = vec![m[1].id, m[2].id];
        expected.sort_by_key(|p| *p.as_bytes());
        assert_eq!(joined, expected);

        for recruit in &m[1..3] {
            let joins = recruit.runtime.joins();
            assert_eq!(joins.len(), 1);
            assert_eq!(joins[0].0, "SWMTKN-fake-worker");
            assert_eq!(joins[0].1, FAKE_CLUSTER_ADDRESS);
        }
        assert!(m[3].runtime.joins().is_empty());
        assert_eq!(m[0].swarm.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn too_many_replicas_is_rejected_before_sending() {
        let (_net, m) = cluster(2);
        let err = m[0]
            .swarm
            .recruit_and_wait(&[m[0].id, m[1].id], 2, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidReplicaCount {
                requested: 2,
                available: 1
            }
        ));
        assert!(m[1].runtime.joins().is_empty());
    }

    #[tokio::test]
    async fn busy_recruit_times_out_and_cleans_up() {
        let (_net, m) = cluster(3);
        m[2].runtime.set_cluster_member(true);
        let err = m[0]
            .swarm
            .recruit_and_wait(&[m[1].id, m[2].id], 2, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::JoinTimedOut {
                wanted: 2,
                joined: 1
            }
        ));
        assert_eq!(m[0].swarm.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn release_makes_members_leave() {
        let (_net, m) = cluster(3);
        let peers = [m[1].id, m[2].id];
        m[0]
            .swarm
            .recruit_and_wait(&peers, 2, Duration::from_secs(2))
            .await
            .unwrap();

        let left = m[0]
            .swarm
            .release_and_wait(&peers, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(left.len(), 2);
        assert!(!m[1].runtime.cluster_member());
        assert!(!m[2].runtime.cluster_member());
    }

    #[tokio::test]
    async fn unsolicited_token_is_refused() {
        let (_net, m) = cluster(2);
        let forger = Keypair::generate();
        let msg = SignedMessage::new(
            &forger,
            new_message_id(),
            false,
            SwarmMessage::JoinToken {
                token: "t".into(),
                address: "a".into(),
            },
        )
        .unwrap();
        let err = m[1].swarm.dispatch(msg).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRequest { .. }));
        assert!(m[1].runtime.joins().is_empty());
    }

    #[tokio::test]
    async fn only_replica_count_recruits_receive_a_token() {
        let (_net, m) = cluster(3);
        let joined = m[0]
            .swarm
            .recruit_and_wait(&[m[1].id, m[2].id], 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);

        // Give a late acceptance time to arrive and be turned away.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let joins = m[1].runtime.joins().len() + m[2].runtime.joins().len();
        assert_eq!(joins, 1);
        assert_eq!(m[0].swarm.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn acceptance_is_dropped_when_the_reply_cannot_be_sent() {
        let (_net, m) = cluster(2);
        // Not on the network, so JoinAccepted has nowhere to go.
        let stranger = Keypair::generate();
        for _ in 0..3 {
            let msg =
                SignedMessage::new(&stranger, new_message_id(), false, SwarmMessage::JoinRequest)
                    .unwrap();
            assert!(m[1].swarm.dispatch(msg).await.is_err());
        }
        assert_eq!(m[1].swarm.accepted_len(), 0);
    }

    #[tokio::test]
    async fn unanswered_acceptance_expires() {
        let net = MemoryNetwork::new();
        let recruit = member(&net);
        let initiator = Keypair::generate();
        let initiator_t = net.join(initiator.peer_id());
        initiator_t.set_handler(SWARM_PROTOCOL, Arc::new(Collector::<SwarmMessage>::new()));
        net.connect(&recruit.transport, &initiator_t);

        let msg_id = new_message_id();
        let msg =
            SignedMessage::new(&initiator, msg_id.clone(), false, SwarmMessage::JoinRequest)
                .unwrap();
        recruit.swarm.dispatch(msg).await.unwrap();
        assert_eq!(recruit.swarm.accepted_len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        recruit.swarm.sweep();
        assert_eq!(recruit.swarm.accepted_len(), 0);

        // A token after the deadline is refused.
        let token = SignedMessage::new(
            &initiator,
            msg_id,
            false,
            SwarmMessage::JoinToken {
                token: "t".into(),
                address: "a".into(),
            },
        )
        .unwrap();
        let err = recruit.swarm.dispatch(token).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRequest { .. }));
        assert!(recruit.runtime.joins().is_empty());
    }
}
