//! cairnd: Cairn peer-to-peer container daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use cairn_core::config::CairnConfig;
use cairn_core::crypto::Keypair;
use cairn_services::{DockerCli, Node, SqliteStore, Transport};

mod tcp;

use tcp::{parse_bootstrap, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });

    // Keypair
    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .context("failed to load identity")?,
    );
    tracing::info!(
        peer = %keypair.peer_id().short(),
        public_key = hex::encode(keypair.public_key()),
        "keypair ready"
    );

    // Store
    let store = Arc::new(SqliteStore::open(&config.store.path)?);
    tracing::info!(path = %config.store.path.display(), "store opened");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // Transport
    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    let listen_addr = listener.local_addr()?;
    let transport = TcpTransport::new(keypair.clone(), listen_addr.to_string());
    tracing::info!(addr = %listen_addr, "listening for peers");

    for entry in &config.network.bootstrap_peers {
        match parse_bootstrap(entry) {
            Ok((peer, address)) => {
                tracing::info!(peer = %peer.short(), address = %address, "bootstrap peer");
                transport.add_peer_address(peer, address);
            }
            Err(e) => tracing::warn!(error = %e, "skipping bootstrap entry"),
        }
    }

    // Node
    let node = Node::start(
        keypair.clone(),
        transport.clone(),
        Arc::new(DockerCli::default()),
        store,
        config.clone(),
    )
    .await;

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener_task = tokio::spawn(transport.clone().run(listener, shutdown_tx.subscribe()));

    let api_port = config.network.api_port;
    let api_task = {
        let state = cairn_api::ApiState {
            node: node.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = cairn_api::serve(state, api_port).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = listener_task      => tracing::error!("listener task exited: {:?}", r),
        r = api_task           => tracing::error!("api server exited: {:?}", r),
    }

    node.shutdown().await;
    Ok(())
}
