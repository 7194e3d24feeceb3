use std::sync::Arc;

use cairn_core::message::TaskMessage;
use cairn_core::wire::TASK_PROTOCOL;
use cairn_services::testing::Collector;
use cairn_services::{ProtocolError, Transport, TransportError};

use crate::*;

#[tokio::test]
async fn test_request_to_departed_peer_fails_fast() {
    let (net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    net.leave(&b.id());

    let err = a.node.run_image(b.id(), "img1").await.unwrap_err();
    assert!(
        matches!(err, ProtocolError::Transport(TransportError::Unreachable { .. })),
        "got {err}"
    );
}

#[tokio::test]
async fn test_request_to_silent_peer_times_out() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let sink = Collector::<TaskMessage>::new();
    b.transport.set_handler(TASK_PROTOCOL, Arc::new(sink.clone()));

    let err = a.node.run_image(b.id(), "img1").await.unwrap_err();
    assert!(matches!(err, ProtocolError::TimedOut(_)), "got {err}");

    let seen = sink.next().await.unwrap();
    assert!(matches!(seen.body, TaskMessage::RunRequest { .. }));
}

#[tokio::test]
async fn test_request_to_unknown_peer_is_rejected() {
    let (_net, nodes) = mesh(1).await;
    let stranger = cairn_core::crypto::Keypair::generate().peer_id();

    let err = nodes[0].node.run_image(stranger, "img1").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Transport(TransportError::UnknownPeer(_))
    ));
}

#[tokio::test]
async fn test_push_to_departed_peer_leaves_no_waiter() {
    let (net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    net.leave(&b.id());

    let path = cairn_services::testing::unique_temp_dir("departed").join("app.tar");
    std::fs::write(&path, b"tiny archive").unwrap();
    assert!(a.node.push_image(b.id(), &path).await.is_err());
    assert_eq!(a.node.transfer().pending_replies(), 0);
}
