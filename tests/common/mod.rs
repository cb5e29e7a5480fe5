#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use wearlink::{AppConfig, Node, SimEndpoint, SimNetwork, StatusCode, WearEvent, WearService};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialise a tracing subscriber for tests; later calls are no-ops
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestNode {
    pub service: Arc<WearService>,
    pub endpoint: Arc<SimEndpoint>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn id(&self) -> wearlink::NodeId {
        self.endpoint.node_id().clone()
    }
}

/// Attach a node to `network`, start its service and connect it
pub async fn start_node(network: &SimNetwork, node: Node) -> TestNode {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = AppConfig::with_data_dir(dir.path());
    let (endpoint, events) = network.add_node(node);
    let service = WearService::new(config, endpoint.clone(), events).expect("service");
    service.start();
    assert_eq!(service.connect().await, StatusCode::Success);
    TestNode { service, endpoint, dir }
}

/// Wait until `service` has seen `count` peers
pub async fn wait_for_peers(service: &WearService, count: usize) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while service.connected_nodes().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peers within timeout");
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<WearEvent>) -> WearEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}
