//! Test support: an in-memory container runtime, a message collector and a
//! harness that starts whole nodes on a `MemoryNetwork`.
//!
//! Compiled for this crate's tests and, with the `test-util` feature, for
//! the workspace integration tests.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use cairn_core::config::CairnConfig;
use cairn_core::crypto::{hash, Keypair, PeerId};
use cairn_core::envelope::SignedMessage;

use crate::memory::{MemoryNetwork, MemoryTransport};
use crate::node::Node;
use crate::runtime::{ClusterRole, ContainerRuntime, ImageSummary, ServiceSpec};
use crate::store::SqliteStore;
use crate::transport::{read_message, BoxStream, StreamHandler};

/// Address `FakeRuntime::cluster_address` reports.
pub const FAKE_CLUSTER_ADDRESS: &str = "10.0.0.1:2377";

// ── Fake runtime ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    images: Vec<ImageSummary>,
    /// container id → image id
    containers: HashMap<String, String>,
    running: HashSet<String>,
    next_container: u64,
    cluster_member: bool,
    joins: Vec<(String, String)>,
    leaves: usize,
    services: Vec<ServiceSpec>,
    loaded: Vec<Vec<u8>>,
    run_error: Option<String>,
}

/// Container runtime that keeps everything in memory. Containers run until
/// `stop_container` is called.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_image(&self, id: &str, tags: &[&str]) {
        self.state().images.push(ImageSummary {
            id: id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        });
    }

    pub fn stop_container(&self, container_id: &str) {
        self.state().running.remove(container_id);
    }

    pub fn running(&self) -> Vec<String> {
        self.state().running.iter().cloned().collect()
    }

    /// Make every later `run_container` fail with `message`.
    pub fn fail_run(&self, message: &str) {
        self.state().run_error = Some(message.to_string());
    }

    pub fn set_cluster_member(&self, member: bool) {
        self.state().cluster_member = member;
    }

    pub fn cluster_member(&self) -> bool {
        self.state().cluster_member
    }

    /// `(token, address)` of every `join_cluster` call.
    pub fn joins(&self) -> Vec<(String, String)> {
        self.state().joins.clone()
    }

    pub fn leaves(&self) -> usize {
        self.state().leaves
    }

    pub fn services(&self) -> Vec<ServiceSpec> {
        self.state().services.clone()
    }

    /// Bytes of every archive passed to `load_image`, in order.
    pub fn loaded_images(&self) -> Vec<Vec<u8>> {
        self.state().loaded.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_container(&self, image_id: &str) -> Result<String> {
        let mut state = self.state();
        if let Some(message) = &state.run_error {
            bail!("{message}");
        }
        if !state.images.iter().any(|i| i.id == image_id) {
            bail!("no such image: {image_id}");
        }
        state.next_container += 1;
        let id = format!("container-{}", state.next_container);
        state.containers.insert(id.clone(), image_id.to_string());
        state.running.insert(id.clone());
        Ok(id)
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        Ok(self.state().running.contains(container_id))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<String> {
        let state = self.state();
        let image = state
            .containers
            .get(container_id)
            .ok_or_else(|| anyhow!("no such container: {container_id}"))?;
        let json = serde_json::json!({
            "Id": container_id,
            "Image": image,
            "State": { "Running": state.running.contains(container_id) },
        });
        Ok(json.to_string())
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.state().containers.keys().cloned().collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        state.running.remove(container_id);
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no such container: {container_id}"))
    }

    async fn load_image(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let id = format!("sha256:{}", hex::encode(hash(&bytes)));
        let mut state = self.state();
        if !state.images.iter().any(|i| i.id == id) {
            state.images.push(ImageSummary {
                id: id.clone(),
                tags: Vec::new(),
            });
        }
        state.loaded.push(bytes);
        Ok(id)
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.state().images.clone())
    }

    async fn is_cluster_member(&self) -> Result<bool> {
        Ok(self.state().cluster_member)
    }

    async fn init_cluster(&self) -> Result<()> {
        let mut state = self.state();
        if state.cluster_member {
            bail!("already part of a cluster");
        }
        state.cluster_member = true;
        Ok(())
    }

    async fn join_cluster(&self, token: &str, address: &str) -> Result<()> {
        let mut state = self.state();
        if state.cluster_member {
            bail!("already part of a cluster");
        }
        state.cluster_member = true;
        state.joins.push((token.to_string(), address.to_string()));
        Ok(())
    }

    async fn leave_cluster(&self) -> Result<()> {
        let mut state = self.state();
        if !state.cluster_member {
            bail!("not part of a cluster");
        }
        state.cluster_member = false;
        state.leaves += 1;
        Ok(())
    }

    async fn join_token(&self, role: ClusterRole) -> Result<String> {
        Ok(format!("SWMTKN-fake-{}", role.as_str()))
    }

    async fn cluster_address(&self) -> Result<String> {
        Ok(FAKE_CLUSTER_ADDRESS.to_string())
    }

    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<String> {
        let mut state = self.state();
        if state.services.iter().any(|s| s.name == spec.name) {
            bail!("service {} already exists", spec.name);
        }
        state.services.push(spec.clone());
        Ok(format!("service-{}", spec.name))
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let before = state.services.len();
        state.services.retain(|s| s.name != name);
        if state.services.len() == before {
            bail!("no such service: {name}");
        }
        Ok(())
    }
}

// ── Collector ─────────────────────────────────────────────────────────────────

/// Stream handler that decodes every inbound message and queues it.
pub struct Collector<B> {
    tx: mpsc::UnboundedSender<SignedMessage<B>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SignedMessage<B>>>>,
    _body: PhantomData<fn() -> B>,
}

impl<B> Clone for Collector<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            _body: PhantomData,
        }
    }
}

impl<B> Default for Collector<B> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            _body: PhantomData,
        }
    }
}

impl<B> Collector<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next message, or `None` after two seconds of silence.
    pub async fn next(&self) -> Option<SignedMessage<B>> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Panics if anything arrives within 200 ms.
    pub async fn assert_quiet(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut rx = self.rx.lock().await;
        assert!(rx.try_recv().is_err(), "unexpected message");
    }
}

#[async_trait]
impl<B> StreamHandler for Collector<B>
where
    B: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, _peer: PeerId, mut stream: BoxStream) {
        if let Ok(msg) = read_message::<B>(&mut stream).await {
            let _ = self.tx.send(msg);
        }
    }
}

// ── Node harness ──────────────────────────────────────────────────────────────

/// A started node plus handles on its collaborators.
pub struct TestNode {
    pub node: Node,
    pub keypair: Arc<Keypair>,
    pub runtime: Arc<FakeRuntime>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<SqliteStore>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.keypair.peer_id()
    }
}

/// A fresh, empty directory under the system temp dir.
pub fn unique_temp_dir(label: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let dir = std::env::temp_dir().join(format!(
        "cairn-test-{}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed),
        label
    ));
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Defaults with timeouts short enough for tests and a private temp dir.
pub fn test_config() -> CairnConfig {
    let mut config = CairnConfig::default();
    config.discovery.ttl_secs = 30;
    config.discovery.pending_capacity = 5;
    config.discovery.sweep_interval_secs = 1;
    config.discovery.collect_timeout_secs = 2;
    config.swarm.join_timeout_secs = 2;
    config.task.monitor_interval_secs = 1;
    config.task.request_timeout_secs = 2;
    config.transfer.temp_dir = unique_temp_dir("transfer");
    config.transfer.reply_timeout_secs = 5;
    config
}

/// Start a node on `net` with a fake runtime and an in-memory store. The
/// node knows no peers yet.
pub async fn spawn_node(net: &MemoryNetwork, config: CairnConfig) -> TestNode {
    let keypair = Arc::new(Keypair::generate());
    let transport = net.join(keypair.peer_id());
    let runtime = Arc::new(FakeRuntime::new());
    let store = Arc::new(SqliteStore::in_memory().unwrap_or_else(|e| panic!("store: {e:#}")));
    let node = Node::start(
        keypair.clone(),
        transport.clone(),
        runtime.clone(),
        store.clone(),
        config,
    )
    .await;
    TestNode {
        node,
        keypair,
        runtime,
        transport,
        store,
    }
}
