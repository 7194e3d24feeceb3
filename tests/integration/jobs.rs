use std::sync::Arc;
use std::time::Duration;

use cairn_services::ProtocolError;

use crate::*;

#[tokio::test]
async fn test_finished_job_notifies_observers_once() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    b.runtime.add_image("img1", &["busybox:latest"]);

    let counter = Arc::new(Counter::default());
    b.node.task().register(counter.clone()).await;

    let container = a.node.run_image(b.id(), "img1").await.unwrap();
    assert_eq!(b.runtime.running(), vec![container.clone()]);
    assert!(b.node.task().jobs().contains(&container).await);

    b.runtime.stop_container(&container);
    let counted = counter.clone();
    let fired = eventually(Duration::from_secs(4), move || {
        let counted = counted.clone();
        async move { counted.get() == 1 }
    })
    .await;
    assert!(fired, "observer was not notified");
    assert!(!b.node.task().jobs().is_busy().await);

    // The monitor is gone; nothing fires twice.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_deregistered_observer_is_not_notified() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    b.runtime.add_image("img1", &[]);

    let counter = Arc::new(Counter::default());
    let id = b.node.task().register(counter.clone()).await;
    assert!(b.node.task().deregister(id).await);

    let container = a.node.run_image(b.id(), "img1").await.unwrap();
    b.runtime.stop_container(&container);
    let jobs = b.node.task().jobs().clone();
    let released = eventually(Duration::from_secs(4), move || {
        let jobs = jobs.clone();
        async move { !jobs.is_busy().await }
    })
    .await;
    assert!(released);
    assert_eq!(counter.get(), 0);
}

#[tokio::test]
async fn test_run_of_unknown_image_returns_remote_error() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let err = a.node.run_image(b.id(), "missing").await.unwrap_err();
    match err {
        ProtocolError::Remote(message) => assert!(message.contains("no such image")),
        other => panic!("expected a remote error, got {other}"),
    }
    assert!(!b.node.task().jobs().is_busy().await);
}

#[tokio::test]
async fn test_inspect_returns_container_json() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    b.runtime.add_image("img1", &[]);

    let container = a.node.run_image(b.id(), "img1").await.unwrap();
    let raw = a.node.inspect_container(b.id(), &container).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["Id"], container.as_str());
    assert_eq!(json["Image"], "img1");
    assert_eq!(json["State"]["Running"], true);

    let err = a.node.inspect_container(b.id(), "nope").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(_)));
}
