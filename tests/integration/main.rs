//! Cairn integration test harness.
//!
//! Every test builds its own in-process network: several full nodes with a
//! fake container runtime, joined by a `MemoryNetwork`. Nothing here needs
//! root, Docker or real sockets.

mod discovery;
mod failures;
mod images;
mod jobs;
mod recruitment;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cairn_core::config::CairnConfig;
use cairn_services::testing::{spawn_node, test_config, TestNode};
use cairn_services::{MemoryNetwork, Observer};

// ── Harness ───────────────────────────────────────────────────────────────────

/// `n` nodes where every node knows every other.
pub async fn mesh(n: usize) -> (MemoryNetwork, Vec<TestNode>) {
    mesh_with(n, test_config).await
}

pub async fn mesh_with(n: usize, config: fn() -> CairnConfig) -> (MemoryNetwork, Vec<TestNode>) {
    let (net, nodes) = spawn_all(n, config).await;
    for i in 0..n {
        for j in (i + 1)..n {
            net.connect(&nodes[i].transport, &nodes[j].transport);
        }
    }
    (net, nodes)
}

/// `n` nodes in a chain: each knows only its neighbours.
pub async fn chain(n: usize) -> (MemoryNetwork, Vec<TestNode>) {
    let (net, nodes) = spawn_all(n, test_config).await;
    for pair in nodes.windows(2) {
        net.connect(&pair[0].transport, &pair[1].transport);
    }
    (net, nodes)
}

async fn spawn_all(n: usize, config: fn() -> CairnConfig) -> (MemoryNetwork, Vec<TestNode>) {
    let net = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(spawn_node(&net, config()).await);
    }
    (net, nodes)
}

/// Poll `check` every 50 ms until it holds or `within` passes.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Observer that counts its notifications.
#[derive(Default)]
pub struct Counter(AtomicUsize);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Observer for Counter {
    fn on_notify(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut v = items.to_vec();
    v.sort();
    v
}
