mod common;

use std::time::Duration;

use common::{init_test_tracing, next_event, start_node, wait_for_peers};
use wearlink::{ChannelConsumer, DataMap, EventKind, Node, NodeId, SimNetwork, StatusCode, WearEvent};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_reaches_only_nearby_nodes() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    let band = start_node(&network, Node::new("band", "Band", true)).await;
    let tablet = start_node(&network, Node::new("tablet", "Tablet", false)).await;
    wait_for_peers(&phone.service, 3).await;

    let (watch_consumer, mut watch_rx) = ChannelConsumer::with_kinds(&[EventKind::MessageReceived]);
    watch.service.add_consumer(watch_consumer.clone());
    let (tablet_consumer, mut tablet_rx) = ChannelConsumer::with_kinds(&[EventKind::MessageReceived]);
    tablet.service.add_consumer(tablet_consumer.clone());
    let (results_consumer, mut results_rx) = ChannelConsumer::with_kinds(&[EventKind::SendMessageResult]);
    phone.service.add_consumer(results_consumer.clone());

    let results = phone.service.broadcast_message("/ping", b"ping").await;
    let targets: Vec<NodeId> = results.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(targets, vec![band.id(), watch.id()]);
    assert!(results.iter().all(|(_, r)| r.status == StatusCode::Success && r.request_id.is_some()));

    // One published result per target
    for _ in 0..2 {
        assert!(matches!(
            next_event(&mut results_rx).await,
            WearEvent::SendMessageResult { ref path, .. } if path == "/ping"
        ));
    }

    match next_event(&mut watch_rx).await {
        WearEvent::MessageReceived(message) => {
            assert_eq!(message.path, "/ping");
            assert_eq!(message.data, b"ping");
            assert_eq!(message.source_node_id, phone.id());
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tablet_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unicast_to_remote_node() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let tablet = start_node(&network, Node::new("tablet", "Tablet", false)).await;
    wait_for_peers(&phone.service, 1).await;

    // Unicast is not restricted to nearby nodes
    let result = phone.service.send_message(&tablet.id(), "/hello", b"hi").await;
    assert_eq!(result.status, StatusCode::Success);

    let missing = phone.service.send_message(&NodeId::new("ghost"), "/hello", b"hi").await;
    assert_eq!(missing.status, StatusCode::TargetNodeNotConnected);
    assert_eq!(missing.request_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_map_message() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::MessageReceived]);
    watch.service.add_consumer(consumer.clone());

    let mut map = DataMap::new();
    map.put("steps", 4200i32).put("goal_met", true);
    let result = phone.service.send_data_map(&watch.id(), "/fitness", &map).await;
    assert!(result.status.is_success());

    match next_event(&mut rx).await {
        WearEvent::MessageReceived(message) => {
            let decoded = DataMap::from_bytes(&message.data).unwrap();
            assert_eq!(decoded.get_int("steps"), Some(4200));
            assert_eq!(decoded.get_bool("goal_met"), Some(true));
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_after_disconnect_is_rejected() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    assert!(phone.service.disconnect().await);
    assert!(!phone.service.disconnect().await);

    let result = phone.service.send_message(&watch.id(), "/ping", b"x").await;
    assert_eq!(result.status, StatusCode::ApiNotConnected);
    assert!(phone.service.broadcast_message("/ping", b"x").await.is_empty());
}
