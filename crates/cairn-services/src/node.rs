//! Node: one cairn participant with every protocol wired to one transport.
//!
//! `Node` is what the daemon and the HTTP API hold. It owns no global state:
//! the transport, runtime, store and config are handed in by the caller.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use cairn_core::config::CairnConfig;
use cairn_core::crypto::{Keypair, PeerId};
use cairn_core::wire::{
    DISCOVERY_PROTOCOL, SWARM_PROTOCOL, TASK_PROTOCOL, UPLOAD_PROTOCOL, UPLOAD_REPLY_PROTOCOL,
};

use crate::discovery::Discovery;
use crate::error::ProtocolError;
use crate::runtime::{ContainerRuntime, ServiceSpec};
use crate::store::Store;
use crate::swarm::Swarm;
use crate::task::TaskProtocol;
use crate::transfer::Transfer;
use crate::transport::Transport;

#[derive(Clone)]
pub struct Node {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<CairnConfig>,
    discovery: Discovery,
    swarm: Swarm,
    task: TaskProtocol,
    transfer: Transfer,
    /// Name of the service this node deployed with `run_task`.
    deployed: Arc<Mutex<Option<String>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Build every protocol, register its handler and start the discovery
    /// cache sweeper.
    pub async fn start(
        keypair: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: CairnConfig,
    ) -> Self {
        let task = TaskProtocol::new(
            keypair.clone(),
            transport.clone(),
            runtime.clone(),
            store.clone(),
            config.task.clone(),
        );
        let discovery = Discovery::new(
            keypair.clone(),
            transport.clone(),
            task.jobs().clone(),
            config.discovery.clone(),
        );
        let swarm = Swarm::new(
            keypair.clone(),
            transport.clone(),
            runtime.clone(),
            config.swarm.clone(),
        );
        let transfer = Transfer::new(
            keypair.clone(),
            transport.clone(),
            runtime.clone(),
            store,
            config.transfer.clone(),
        );

        transport.set_handler(DISCOVERY_PROTOCOL, Arc::new(discovery.clone()));
        transport.set_handler(SWARM_PROTOCOL, Arc::new(swarm.clone()));
        transport.set_handler(TASK_PROTOCOL, Arc::new(task.clone()));
        transport.set_handler(UPLOAD_PROTOCOL, transfer.upload_handler());
        transport.set_handler(UPLOAD_REPLY_PROTOCOL, transfer.reply_handler());

        // Parked discovery answers go out when a job finishes.
        task.register(Arc::new(discovery.clone())).await;

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(discovery.clone().run_sweeper(shutdown_tx.subscribe()));
        tokio::spawn(swarm.clone().run_sweeper(shutdown_tx.subscribe()));

        tracing::info!(peer = %keypair.peer_id().short(), "node started");
        Self {
            keypair,
            transport,
            runtime,
            config: Arc::new(config),
            discovery,
            swarm,
            task,
            transfer,
            deployed: Arc::new(Mutex::new(None)),
            shutdown_tx,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public_key())
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.transport.known_peers()
    }

    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn task(&self) -> &TaskProtocol {
        &self.task
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub async fn deployed_service(&self) -> Option<String> {
        self.deployed.lock().await.clone()
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Find `n` free nodes, waiting at most the configured collect timeout.
    pub async fn discover(&self, n: usize) -> Result<Vec<PeerId>, ProtocolError> {
        let session = self.discovery.initiate(n).await?;
        session
            .collect(self.config.discovery.collect_timeout())
            .await
    }

    /// Make sure this node manages a cluster, recruit every peer into it and
    /// deploy the service described by `spec_json`. Returns the service id.
    pub async fn run_task(
        &self,
        spec_json: &str,
        peers: &[PeerId],
    ) -> Result<String, ProtocolError> {
        let spec: ServiceSpec = serde_json::from_str(spec_json)
            .map_err(|e| ProtocolError::InvalidTaskSpec(e.to_string()))?;
        if spec.name.trim().is_empty() || spec.image.trim().is_empty() {
            return Err(ProtocolError::InvalidTaskSpec(
                "name and image are required".into(),
            ));
        }

        if !self.runtime.is_cluster_member().await? {
            self.runtime.init_cluster().await?;
            tracing::info!("cluster initialised");
        }

        let local = self.peer_id();
        let recruits: Vec<PeerId> = peers.iter().copied().filter(|p| *p != local).collect();
        self.swarm
            .recruit_and_wait(&recruits, recruits.len(), self.config.swarm.join_timeout())
            .await?;

        let service_id = self.runtime.deploy_service(&spec).await?;
        *self.deployed.lock().await = Some(spec.name.clone());
        tracing::info!(
            service = %spec.name,
            service_id = %service_id,
            replicas = spec.replicas,
            peers = recruits.len(),
            "task deployed"
        );
        Ok(service_id)
    }

    /// Undo `run_task`: remove the service, release the peers and leave
    /// the cluster.
    pub async fn stop_task(&self, peers: &[PeerId]) -> Result<(), ProtocolError> {
        let deployed = self.deployed.lock().await.clone();
        if let Some(name) = deployed {
            self.runtime.remove_service(&name).await?;
            *self.deployed.lock().await = None;
            tracing::info!(service = %name, "task removed");
        }
        self.swarm
            .release_and_wait(peers, self.config.swarm.join_timeout())
            .await?;
        if self.runtime.is_cluster_member().await? {
            self.runtime.leave_cluster().await?;
        }
        Ok(())
    }

    /// Upload a local image archive to `peer`. Returns the remote image id.
    pub async fn push_image(&self, peer: PeerId, path: &Path) -> Result<String, ProtocolError> {
        self.transfer
            .push_image(peer, path, self.config.transfer.reply_timeout())
            .await
    }

    /// Run `image_id` on `peer`. Returns the remote container id.
    pub async fn run_image(&self, peer: PeerId, image_id: &str) -> Result<String, ProtocolError> {
        self.task
            .request_run(peer, image_id, self.config.task.request_timeout())
            .await
    }

    pub async fn inspect_container(
        &self,
        peer: PeerId,
        container_id: &str,
    ) -> Result<String, ProtocolError> {
        self.task
            .inspect_container(peer, container_id, self.config.task.request_timeout())
            .await
    }

    pub async fn list_images(
        &self,
        peer: PeerId,
        public_key: &str,
    ) -> Result<String, ProtocolError> {
        self.task
            .list_images(peer, public_key, self.config.task.request_timeout())
            .await
    }

    /// Remove the containers of jobs still running here and stop background
    /// tasks. Handlers stay registered.
    pub async fn shutdown(&self) {
        self.task.remove_running_jobs().await;
        let _ = self.shutdown_tx.send(());
    }
}
