use cairn_services::testing::FAKE_CLUSTER_ADDRESS;
use cairn_services::ProtocolError;

use crate::*;

const SPEC: &str = r#"{"name": "web", "image": "nginx:latest", "replicas": 2}"#;

#[tokio::test]
async fn test_run_and_stop_task_across_three_nodes() {
    let (_net, nodes) = mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let service_id = a.node.run_task(SPEC, &[b.id(), c.id()]).await.unwrap();
    assert_eq!(service_id, "service-web");
    assert!(a.runtime.cluster_member());
    assert_eq!(a.node.deployed_service().await.as_deref(), Some("web"));

    for recruit in [b, c] {
        assert!(recruit.runtime.cluster_member());
        assert_eq!(
            recruit.runtime.joins(),
            vec![(
                "SWMTKN-fake-worker".to_string(),
                FAKE_CLUSTER_ADDRESS.to_string()
            )]
        );
    }
    let services = a.runtime.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].replicas, 2);

    a.node.stop_task(&[b.id(), c.id()]).await.unwrap();
    assert!(a.runtime.services().is_empty());
    assert!(!a.runtime.cluster_member());
    assert_eq!(a.node.deployed_service().await, None);
    for recruit in [b, c] {
        assert!(!recruit.runtime.cluster_member());
        assert_eq!(recruit.runtime.leaves(), 1);
    }
    assert_eq!(a.node.swarm().in_flight_len(), 0);
}

#[tokio::test]
async fn test_run_task_times_out_when_a_recruit_is_in_another_cluster() {
    let (_net, nodes) = mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    c.runtime.set_cluster_member(true);

    let err = a.node.run_task(SPEC, &[b.id(), c.id()]).await.unwrap_err();
    assert!(
        matches!(err, ProtocolError::JoinTimedOut { wanted: 2, joined: 1 }),
        "got {err}"
    );
    assert!(b.runtime.cluster_member());
    assert!(c.runtime.joins().is_empty());
    assert!(a.runtime.services().is_empty());
    assert_eq!(a.node.swarm().in_flight_len(), 0);
}

#[tokio::test]
async fn test_run_task_rejects_bad_specs() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    for spec in ["not json", r#"{"name": "", "image": "nginx"}"#] {
        let err = a.node.run_task(spec, &[b.id()]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTaskSpec(_)), "got {err}");
    }
    assert!(!a.runtime.cluster_member());
    assert!(!b.runtime.cluster_member());
}

#[tokio::test]
async fn test_run_task_with_only_self_deploys_locally() {
    let (_net, nodes) = mesh(2).await;
    let a = &nodes[0];

    let service_id = a.node.run_task(SPEC, &[a.id()]).await.unwrap();
    assert_eq!(service_id, "service-web");
    assert!(nodes[1].runtime.joins().is_empty());
}
