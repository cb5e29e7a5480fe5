mod common;

use common::{init_test_tracing, next_event, start_node, wait_for_peers};
use wearlink::{AppConfig, ChannelConsumer, EventKind, Node, NodeId, SimNetwork, StatusCode, WearEvent, WearService};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_consumer_sees_connected() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    assert!(phone.service.is_connected());

    let (consumer, mut rx) = ChannelConsumer::new();
    assert!(phone.service.add_consumer(consumer.clone()));
    assert!(!phone.service.add_consumer(consumer.clone()));
    assert!(matches!(next_event(&mut rx).await, WearEvent::Connected));

    assert!(phone.service.remove_consumer(&consumer));
    assert!(!phone.service.remove_consumer(&consumer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unavailable_transport_reports_failure() {
    init_test_tracing();
    let network = SimNetwork::new();
    network.set_available(false);

    let dir = tempfile::tempdir().unwrap();
    let (endpoint, events) = network.add_node(Node::new("phone", "Phone", true));
    let service = WearService::new(AppConfig::with_data_dir(dir.path()), endpoint, events).unwrap();
    assert!(service.start());
    assert!(!service.start());

    let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::Connected, EventKind::ConnectionFailed]);
    service.add_consumer(consumer.clone());

    assert_eq!(service.connect().await, StatusCode::ApiNotConnected);
    match next_event(&mut rx).await {
        WearEvent::ConnectionFailed { status } => assert_eq!(status, StatusCode::ApiNotConnected),
        other => panic!("Unexpected event: {:?}", other),
    }
    assert!(!service.is_connected());

    // A later attempt is allowed once the transport is back
    network.set_available(true);
    assert_eq!(service.connect().await, StatusCode::Success);
    assert!(matches!(next_event(&mut rx).await, WearEvent::Connected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_tracking() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;

    let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::PeerConnected, EventKind::PeerDisconnected]);
    phone.service.add_consumer(consumer.clone());

    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    match next_event(&mut rx).await {
        WearEvent::PeerConnected { node } => assert_eq!(node.id, watch.id()),
        other => panic!("Unexpected event: {:?}", other),
    }
    wait_for_peers(&phone.service, 1).await;
    assert_eq!(
        phone.service.node_by_id(&NodeId::new("watch")).map(|n| n.display_name),
        Some("Watch".to_string())
    );

    assert!(watch.service.disconnect().await);
    match next_event(&mut rx).await {
        WearEvent::PeerDisconnected { node } => assert_eq!(node.id, watch.id()),
        other => panic!("Unexpected event: {:?}", other),
    }
    assert!(phone.service.connected_nodes().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_capabilities_advertised_on_connect() {
    init_test_tracing();
    let network = SimNetwork::new();
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        initial_capabilities: vec!["voice".to_string()],
        ..AppConfig::with_data_dir(dir.path())
    };
    let (endpoint, events) = network.add_node(Node::new("phone", "Phone", true));
    let phone = WearService::new(config, endpoint, events).unwrap();
    phone.start();

    let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::CapabilityChanged]);
    watch.service.add_consumer(consumer.clone());

    assert_eq!(phone.connect().await, StatusCode::Success);
    assert_eq!(phone.data_layer().watched_capabilities(), vec!["voice".to_string()]);

    match next_event(&mut rx).await {
        WearEvent::CapabilityChanged { capability, nodes } => {
            assert_eq!(capability, "voice");
            assert!(nodes.iter().any(|n| n.id.as_str() == "phone"));
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}
