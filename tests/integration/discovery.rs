use std::time::Duration;

use crate::*;

#[tokio::test]
async fn test_discovery_reaches_beyond_neighbours() {
    let (_net, nodes) = chain(4).await;
    let found = nodes[0].node.discover(3).await.unwrap();

    let expected: Vec<_> = nodes[1..].iter().map(|n| n.id()).collect();
    assert_eq!(sorted(&found), sorted(&expected));

    // The far end had to look the originator up before answering.
    assert!(nodes[3].node.known_peers().contains(&nodes[0].id()));
}

#[tokio::test]
async fn test_discovery_answers_once_per_node_in_a_triangle() {
    let (_net, nodes) = mesh(3).await;
    let session = nodes[0].node.discovery().initiate(5).await.unwrap();
    let init_hash = session.init_hash.clone();

    // Only two other nodes exist, so asking for five must time out with two.
    let err = session.collect(Duration::from_secs(1)).await.unwrap_err();
    match err {
        cairn_services::ProtocolError::DiscoveryTimedOut { wanted, found } => {
            assert_eq!(wanted, 5);
            assert_eq!(found, 2);
        }
        other => panic!("expected DiscoveryTimedOut, got {other}"),
    }

    for n in &nodes {
        assert!(n.node.discovery().is_cached(&init_hash));
    }
}

#[tokio::test]
async fn test_busy_node_answers_after_its_job_ends() {
    let (_net, nodes) = mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    b.runtime.add_image("img1", &["busybox:latest"]);

    let container = a.node.run_image(b.id(), "img1").await.unwrap();
    assert!(b.node.task().jobs().is_busy().await);

    let session = a.node.discovery().initiate(2).await.unwrap();
    let parked = eventually(Duration::from_secs(2), move || async move {
        b.node.discovery().pending_len().await == 1
    })
    .await;
    assert!(parked, "busy node should park the request");

    b.runtime.stop_container(&container);
    let found = session.collect(Duration::from_secs(5)).await.unwrap();
    assert_eq!(sorted(&found), sorted(&[b.id(), c.id()]));
    assert_eq!(b.node.discovery().pending_len().await, 0);
}

#[tokio::test]
async fn test_discovery_on_a_lone_node_times_out() {
    let (_net, nodes) = mesh(1).await;
    let err = nodes[0].node.discover(1).await.unwrap_err();
    assert!(matches!(
        err,
        cairn_services::ProtocolError::DiscoveryTimedOut { wanted: 1, found: 0 }
    ));
}
