mod common;

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{init_test_tracing, next_event, start_node, wait_for_peers};
use wearlink::core::{CorrelationId, TransferMode, TransferOutcome, TransferStatus};
use wearlink::protocol::TransferPath;
use wearlink::{ChannelConsumer, EventKind, Node, SimNetwork, StatusCode, Transport, WearEvent};

async fn next_outcome(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WearEvent>) -> TransferOutcome {
    loop {
        if let WearEvent::TransferFinished(outcome) = next_event(rx).await {
            return outcome;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_transfer_completes() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());
    let (sent, mut sent_rx) = ChannelConsumer::with_kinds(&[EventKind::SendFileResult]);
    phone.service.add_consumer(sent.clone());

    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let source = phone.dir.path().join("a b.jpg");
    std::fs::write(&source, &content).unwrap();

    let request_id = phone
        .service
        .send_file(&watch.id(), &source, None, None)
        .await
        .expect("file sent");

    match next_event(&mut sent_rx).await {
        WearEvent::SendFileResult { status, request_id: id } => {
            assert_eq!(status, StatusCode::Success);
            assert_eq!(id, request_id);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.status, TransferStatus::Completed);
    assert_eq!(outcome.mode, TransferMode::File);
    assert_eq!(outcome.request_id, request_id);
    assert_eq!(outcome.name.as_deref(), Some("a b.jpg"));
    assert_eq!(outcome.declared_bytes, Some(10_000));
    assert_eq!(outcome.received_bytes, 10_000);

    let stored = outcome.file.expect("local file");
    assert_eq!(stored, watch.service.transfers().download_dir().join("a b.jpg"));
    assert_eq!(std::fs::read(&stored).unwrap(), content);

    // Both sides release the channel once the transfer is over
    tokio::time::timeout(Duration::from_secs(5), async {
        while network.open_channel_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel released");
    assert!(watch.service.transfers().active_transfers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abnormal_close_fails_transfer() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let request_id = CorrelationId::new();
    let path = TransferPath::file("a b.jpg", 10_000, request_id.clone()).encode().unwrap();
    let channel = phone.endpoint.open_channel(&watch.id(), &path).await.unwrap();
    let mut writer = phone.endpoint.output_stream(&channel).await.unwrap();
    writer.write_all(&[7u8; 4096]).await.unwrap();
    drop(writer);

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.status, TransferStatus::Failed);
    assert_eq!(outcome.status_code(), StatusCode::Error);
    assert_eq!(outcome.request_id, request_id);
    assert_eq!(outcome.received_bytes, 4096);
    assert_eq!(outcome.declared_bytes, Some(10_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_normal_close_with_short_count_fails() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let path = TransferPath::file("short.bin", 10_000, CorrelationId::new()).encode().unwrap();
    let channel = phone.endpoint.open_channel(&watch.id(), &path).await.unwrap();
    let mut writer = phone.endpoint.output_stream(&channel).await.unwrap();
    writer.write_all(&[1u8; 4096]).await.unwrap();
    writer.shutdown().await.unwrap();

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.status, TransferStatus::Failed);
    assert_eq!(outcome.received_bytes, 4096);

    // Exactly one terminal event per session
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(finished_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_supplied_name_cannot_escape_download_dir() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let path = TransferPath::file("../../etc/evil.txt", 3, CorrelationId::new()).encode().unwrap();
    let channel = phone.endpoint.open_channel(&watch.id(), &path).await.unwrap();
    let mut writer = phone.endpoint.output_stream(&channel).await.unwrap();
    writer.write_all(b"abc").await.unwrap();
    writer.shutdown().await.unwrap();

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.status, TransferStatus::Completed);
    assert_eq!(
        outcome.file.unwrap(),
        watch.service.transfers().download_dir().join("evil.txt")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_transfer() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (consumer, mut events) =
        ChannelConsumer::with_kinds(&[EventKind::InputStreamOpened, EventKind::TransferFinished]);
    watch.service.add_consumer(consumer.clone());

    let mut outgoing = phone.service.open_output_stream(&watch.id(), None).await.unwrap();
    outgoing.writer.write_all(b"live audio frames").await.unwrap();
    outgoing.writer.shutdown().await.unwrap();

    let stream = match next_event(&mut events).await {
        WearEvent::InputStreamOpened {
            status,
            request_id,
            stream,
            ..
        } => {
            assert_eq!(status, StatusCode::Success);
            assert_eq!(request_id, outgoing.request_id);
            stream
        }
        other => panic!("Unexpected event: {:?}", other),
    };

    let mut reader = stream.take().await.expect("first take owns the reader");
    assert!(stream.take().await.is_none());
    let mut received = Vec::new();
    reader.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"live audio frames");

    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.mode, TransferMode::Stream);
    assert_eq!(outcome.status, TransferStatus::Completed);
    assert!(outcome.file.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_channel_reaches_consumers() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (consumer, mut events) = ChannelConsumer::with_kinds(&[EventKind::ChannelOpened]);
    watch.service.add_consumer(consumer.clone());

    let channel = phone.service.open_channel(&watch.id(), "/app/voice").await.unwrap();
    match next_event(&mut events).await {
        WearEvent::ChannelOpened { channel: opened } => {
            assert_eq!(opened.token, channel.token);
            assert_eq!(opened.path, "/app/voice");
            assert_eq!(opened.node_id, phone.id());
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_creation_failure_fails_transfer() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;

    // A plain file where the download directory should be
    let download_dir = watch.service.transfers().download_dir().to_path_buf();
    std::fs::remove_dir_all(&download_dir).unwrap();
    std::fs::write(&download_dir, b"not a directory").unwrap();

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let request_id = CorrelationId::new();
    let path = TransferPath::file("x.bin", 3, request_id.clone()).encode().unwrap();
    let channel = phone.endpoint.open_channel(&watch.id(), &path).await.unwrap();
    let mut writer = phone.endpoint.output_stream(&channel).await.unwrap();
    // The receiver may already have closed its side
    let _ = writer.write_all(b"abc").await;
    let _ = writer.shutdown().await;

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.status, TransferStatus::Failed);
    assert_eq!(outcome.request_id, request_id);
    assert_eq!(outcome.file, Some(download_dir.join("x.bin")));
    assert_eq!(outcome.received_bytes, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(finished_rx.try_recv().is_err());
    assert!(watch.service.transfers().active_transfers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspension_drops_active_sessions() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (opened, mut opened_rx) = ChannelConsumer::with_kinds(&[EventKind::InputStreamOpened]);
    watch.service.add_consumer(opened.clone());

    let outgoing = phone.service.open_output_stream(&watch.id(), None).await.unwrap();
    assert!(matches!(next_event(&mut opened_rx).await, WearEvent::InputStreamOpened { .. }));
    assert_eq!(watch.service.transfers().active_transfers(), vec![outgoing.request_id.clone()]);

    watch.endpoint.suspend();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !watch.service.transfers().active_transfers().is_empty() || watch.service.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions cleared on suspension");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_range_transfer() {
    init_test_tracing();
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true)).await;
    let watch = start_node(&network, Node::new("watch", "Watch", true)).await;
    wait_for_peers(&phone.service, 1).await;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    let source = phone.dir.path().join("recording.raw");
    std::fs::write(&source, &content).unwrap();

    let request_id = phone
        .service
        .send_file_range(&watch.id(), &source, Some("part.raw"), None, 1_000, Some(4_096))
        .await
        .unwrap();

    let outcome = next_outcome(&mut finished_rx).await;
    assert_eq!(outcome.request_id, request_id);
    assert_eq!(outcome.status, TransferStatus::Completed);
    assert_eq!(outcome.declared_bytes, Some(4_096));
    assert_eq!(std::fs::read(outcome.file.unwrap()).unwrap(), &content[1_000..5_096]);

    // A length running past the end is cut to the file
    phone
        .service
        .send_file_range(&watch.id(), &source, Some("tail.raw"), None, 9_000, Some(4_096))
        .await
        .unwrap();
    let tail = next_outcome(&mut finished_rx).await;
    assert_eq!(tail.status, TransferStatus::Completed);
    assert_eq!(tail.declared_bytes, Some(1_000));
    assert_eq!(std::fs::read(tail.file.unwrap()).unwrap(), &content[9_000..]);

    let err = phone
        .service
        .send_file_range(&watch.id(), &source, None, None, 10_001, None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::DeveloperError);
}
