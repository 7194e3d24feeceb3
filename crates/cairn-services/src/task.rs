//! Task execution protocol: remote run requests, the running-job monitor,
//! and the inspection and signed-image listing requests that ride on the same
//! protocol id.
//!
//! Per job on the executing node: Requested → Running → Finished. When the
//! monitor sees a container stop it drops the id from `RunningJobs` and
//! notifies every registered observer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};

use cairn_core::config::TaskConfig;
use cairn_core::crypto::{verify_signature, Keypair, PeerId};
use cairn_core::envelope::{new_message_id, SignedMessage};
use cairn_core::message::{RemoteResult, TaskMessage};
use cairn_core::wire::TASK_PROTOCOL;

use crate::error::ProtocolError;
use crate::observer::{Observer, ObserverId, ObserverRegistry};
use crate::runtime::ContainerRuntime;
use crate::store::{load_image_record, Store};
use crate::transport::{
    ensure_verified, read_message, send_message, BoxStream, StreamHandler, Transport,
};

/// Container ids of jobs this node is executing. A node with any running
/// job is busy.
#[derive(Clone, Default)]
pub struct RunningJobs {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, container_id: &str) {
        self.inner.lock().await.insert(container_id.to_string());
    }

    /// Returns false if the id was not tracked.
    pub async fn remove(&self, container_id: &str) -> bool {
        self.inner.lock().await.remove(container_id)
    }

    pub async fn contains(&self, container_id: &str) -> bool {
        self.inner.lock().await.contains(container_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_busy(&self) -> bool {
        !self.inner.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.iter().cloned().collect()
    }
}

struct Waiter {
    peer: PeerId,
    tx: oneshot::Sender<RemoteResult<String>>,
}

#[derive(Clone)]
pub struct TaskProtocol {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    config: TaskConfig,
    jobs: RunningJobs,
    observers: ObserverRegistry,
    /// request message id → caller waiting for the response
    waiters: Arc<DashMap<String, Waiter>>,
}

impl TaskProtocol {
    pub fn new(
        keypair: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: TaskConfig,
    ) -> Self {
        Self {
            keypair,
            transport,
            runtime,
            store,
            config,
            jobs: RunningJobs::new(),
            observers: ObserverRegistry::new(),
            waiters: Arc::new(DashMap::new()),
        }
    }

    pub fn jobs(&self) -> &RunningJobs {
        &self.jobs
    }

    pub async fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.observers.register(observer).await
    }

    pub async fn deregister(&self, id: ObserverId) -> bool {
        self.observers.deregister(id).await
    }

    /// Fan out to every observer, in registration order.
    pub async fn notify(&self) {
        self.observers.notify().await;
    }

    /// Remove the containers of every job still tracked and stop tracking
    /// them. Ids the runtime no longer lists are only forgotten. Returns how
    /// many containers were removed.
    pub async fn remove_running_jobs(&self) -> usize {
        let ids = self.jobs.ids().await;
        if ids.is_empty() {
            return 0;
        }
        let listed = match self.runtime.list_containers().await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(error = %e, "could not list containers, jobs left running");
                return 0;
            }
        };
        let mut removed = 0;
        for id in ids {
            if listed.contains(&id) {
                match self.runtime.remove_container(&id).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(container_id = %id, error = %e, "job not removed");
                        continue;
                    }
                }
            }
            self.jobs.remove(&id).await;
        }
        tracing::info!(removed, "running jobs removed");
        self.notify().await;
        removed
    }

    // ── Outbound requests ────────────────────────────────────────────────────

    /// Ask `peer` to run `image_id`. Returns the remote container id.
    pub async fn request_run(
        &self,
        peer: PeerId,
        image_id: &str,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let body = TaskMessage::RunRequest {
            image_id: image_id.to_string(),
        };
        self.request(peer, body, "run request", timeout).await
    }

    /// Raw JSON inspection of a container on `peer`.
    pub async fn inspect_container(
        &self,
        peer: PeerId,
        container_id: &str,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let body = TaskMessage::InspectRequest {
            container_id: container_id.to_string(),
        };
        self.request(peer, body, "inspect request", timeout).await
    }

    /// JSON list of images on `peer` that carry a signature made with
    /// `public_key` (hex).
    pub async fn list_images(
        &self,
        peer: PeerId,
        public_key: &str,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let body = TaskMessage::ListImagesRequest {
            public_key: public_key.to_string(),
        };
        self.request(peer, body, "list images request", timeout)
            .await
    }

    async fn request(
        &self,
        peer: PeerId,
        body: TaskMessage,
        what: &'static str,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let msg_id = new_message_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(msg_id.clone(), Waiter { peer, tx });

        let sent = async {
            let msg = SignedMessage::new(&self.keypair, msg_id.clone(), false, body)?;
            send_message(self.transport.as_ref(), peer, TASK_PROTOCOL, &msg).await
        }
        .await;
        if let Err(e) = sent {
            self.waiters.remove(&msg_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.into_result().map_err(ProtocolError::Remote),
            Ok(Err(_)) => Err(ProtocolError::TimedOut(what)),
            Err(_) => {
                self.waiters.remove(&msg_id);
                tracing::warn!(peer = %peer.short(), msg_id = %msg_id, "{what} timed out");
                Err(ProtocolError::TimedOut(what))
            }
        }
    }

    async fn respond(
        &self,
        peer: PeerId,
        msg_id: &str,
        body: TaskMessage,
    ) -> Result<(), ProtocolError> {
        let msg = SignedMessage::new(&self.keypair, msg_id, false, body)?;
        send_message(self.transport.as_ref(), peer, TASK_PROTOCOL, &msg).await
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    async fn dispatch(&self, msg: SignedMessage<TaskMessage>) -> Result<(), ProtocolError> {
        ensure_verified(&msg)?;
        let sender = msg.sender();
        let msg_id = msg.envelope.message_id;
        match msg.body {
            TaskMessage::RunRequest { image_id } => {
                self.on_run_request(sender, &msg_id, &image_id).await
            }
            TaskMessage::InspectRequest { container_id } => {
                let result = self.runtime.inspect_container(&container_id).await;
                let body = TaskMessage::InspectResponse {
                    result: result.into(),
                };
                self.respond(sender, &msg_id, body).await
            }
            TaskMessage::ListImagesRequest { public_key } => {
                let result = signed_images(self.runtime.as_ref(), self.store.as_ref(), &public_key)
                    .await;
                let body = TaskMessage::ListImagesResponse {
                    result: result.into(),
                };
                self.respond(sender, &msg_id, body).await
            }
            TaskMessage::RunResponse { result }
            | TaskMessage::InspectResponse { result }
            | TaskMessage::ListImagesResponse { result } => {
                self.on_response(sender, &msg_id, result)
            }
        }
    }

    async fn on_run_request(
        &self,
        sender: PeerId,
        msg_id: &str,
        image_id: &str,
    ) -> Result<(), ProtocolError> {
        let result = self.runtime.run_container(image_id).await;
        match &result {
            Ok(container_id) => {
                self.jobs.insert(container_id).await;
                self.spawn_monitor(container_id.clone());
                tracing::info!(
                    peer = %sender.short(),
                    msg_id,
                    image_id,
                    container_id = %container_id,
                    "job started"
                );
            }
            Err(e) => tracing::warn!(
                peer = %sender.short(),
                msg_id,
                image_id,
                error = %e,
                "run request failed"
            ),
        }
        let body = TaskMessage::RunResponse {
            result: result.into(),
        };
        self.respond(sender, msg_id, body).await
    }

    fn on_response(
        &self,
        sender: PeerId,
        msg_id: &str,
        result: RemoteResult<String>,
    ) -> Result<(), ProtocolError> {
        match self.waiters.remove_if(msg_id, |_, w| w.peer == sender) {
            Some((_, waiter)) => {
                let _ = waiter.tx.send(result);
                Ok(())
            }
            None => Err(ProtocolError::UnknownRequest {
                peer: sender,
                msg_id: msg_id.to_string(),
            }),
        }
    }

    /// Poll the container until it stops, then release the job and notify.
    fn spawn_monitor(&self, container_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.monitor_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                match this.runtime.is_running(&container_id).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        tracing::info!(container_id = %container_id, "job finished");
                    }
                    Err(e) => {
                        tracing::warn!(
                            container_id = %container_id,
                            error = %e,
                            "job state unknown, releasing"
                        );
                    }
                }
                break;
            }
            if this.jobs.remove(&container_id).await {
                this.notify().await;
            }
        });
    }
}

#[async_trait]
impl StreamHandler for TaskProtocol {
    async fn handle(&self, peer: PeerId, mut stream: BoxStream) {
        let msg = match read_message::<TaskMessage>(&mut stream).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    peer = %peer.short(),
                    error = %e,
                    "dropping undecodable task message"
                );
                return;
            }
        };
        let msg_id = msg.message_id().to_string();
        let kind = msg.body.kind();
        if let Err(e) = self.dispatch(msg).await {
            match e {
                ProtocolError::UnknownRequest { .. } => tracing::error!(
                    peer = %peer.short(),
                    msg_id = %msg_id,
                    kind,
                    error = %e,
                    "task protocol violation"
                ),
                _ => tracing::warn!(
                    peer = %peer.short(),
                    msg_id = %msg_id,
                    kind,
                    error = %e,
                    "task message dropped"
                ),
            }
        }
    }
}

// ── Signed image listing ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SignedImage {
    id: String,
    tags: Vec<String>,
    content_hash: String,
}

/// Images known to the runtime whose record holds a signature that verifies
/// with `public_key` over the raw content hash. Returned as a JSON array.
async fn signed_images(
    runtime: &dyn ContainerRuntime,
    store: &dyn Store,
    public_key: &str,
) -> anyhow::Result<String> {
    let key: [u8; 32] = hex::decode(public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid public key {public_key:?}"))?;

    let mut out = Vec::new();
    for image in runtime.list_images().await? {
        let Some(record) = load_image_record(store, &image.id)? else {
            continue;
        };
        let Ok(hash) = hex::decode(&record.content_hash) else {
            continue;
        };
        let signed = record.signatures.iter().any(|sig| {
            hex::decode(sig)
                .map(|sig| verify_signature(&key, &hash, &sig))
                .unwrap_or(false)
        });
        if signed {
            out.push(SignedImage {
                id: image.id,
                tags: image.tags,
                content_hash: record.content_hash,
            });
        }
    }
    Ok(serde_json::to_string(&out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::store::{record_image_upload, SqliteStore};
    use crate::testing::FakeRuntime;
    use cairn_core::crypto::hash;

    struct Counter(std::sync::atomic::AtomicUsize);

    impl Observer for Counter {
        fn on_notify(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn remaining_jobs_are_removed_from_the_runtime() {
        let net = MemoryNetwork::new();
        let keypair = Arc::new(Keypair::generate());
        let transport = net.join(keypair.peer_id());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("sha256:app", &[]);
        let task = TaskProtocol::new(
            keypair,
            transport,
            runtime.clone(),
            Arc::new(SqliteStore::in_memory().unwrap()),
            TaskConfig::default(),
        );
        let counter = Arc::new(Counter(Default::default()));
        task.register(counter.clone()).await;

        let kept = runtime.run_container("sha256:app").await.unwrap();
        let job = runtime.run_container("sha256:app").await.unwrap();
        task.jobs().insert(&job).await;
        // Tracked but already gone from the runtime.
        task.jobs().insert("container-gone").await;

        assert_eq!(task.remove_running_jobs().await, 1);
        assert!(!task.jobs().is_busy().await);
        assert_eq!(runtime.list_containers().await.unwrap(), vec![kept]);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert_eq!(task.remove_running_jobs().await, 0);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_jobs_tracks_busy_state() {
        let jobs = RunningJobs::new();
        assert!(!jobs.is_busy().await);
        jobs.insert("c1").await;
        assert!(jobs.is_busy().await);
        assert!(jobs.contains("c1").await);
        assert!(jobs.remove("c1").await);
        assert!(!jobs.remove("c1").await);
        assert_eq!(jobs.len().await, 0);
    }

    #[tokio::test]
    async fn listing_keeps_only_images_signed_by_key() {
        let runtime = FakeRuntime::new();
        let store = SqliteStore::in_memory().unwrap();
        let signer = Keypair::generate();
        let stranger = Keypair::generate();

        let good_hash = hash(b"good image");
        let other_hash = hash(b"other image");
        runtime.add_image("sha256:good", &["app:1"]);
        runtime.add_image("sha256:other", &[]);
        runtime.add_image("sha256:unrecorded", &[]);
        record_image_upload(
            &store,
            "sha256:good",
            &hex::encode(good_hash),
            &hex::encode(signer.sign(&good_hash)),
            1,
        )
        .unwrap();
        record_image_upload(
            &store,
            "sha256:other",
            &hex::encode(other_hash),
            &hex::encode(stranger.sign(&other_hash)),
            1,
        )
        .unwrap();

        let json = signed_images(&runtime, &store, &hex::encode(signer.public_key()))
            .await
            .unwrap();
        let listed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], "sha256:good");
        assert_eq!(listed[0]["tags"][0], "app:1");

        assert!(signed_images(&runtime, &store, "zz").await.is_err());
    }
}
