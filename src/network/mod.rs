//! Connection lifecycle against the transport plane.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::{Node, StatusCode, Transport, TransportEvent, WearEvent};
use crate::data_layer::DataLayer;
use crate::discovery::NodeDirectory;
use crate::infrastructure::events::ConsumerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Drives connect/disconnect and keeps the node directory in step with
/// peer and capability notifications.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    directory: Arc<NodeDirectory>,
    data_layer: Arc<DataLayer>,
    initial_capabilities: Vec<String>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConsumerRegistry>,
        directory: Arc<NodeDirectory>,
        data_layer: Arc<DataLayer>,
        initial_capabilities: Vec<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            directory,
            data_layer,
            initial_capabilities,
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let mut guard = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the transport. A no-op while connecting or connected.
    pub async fn connect(&self) -> StatusCode {
        {
            let mut guard = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *guard != ConnectionState::Disconnected {
                debug!(state = ?*guard, "connect() ignored");
                return StatusCode::Success;
            }
            *guard = ConnectionState::Connecting;
        }

        if let Err(e) = self.transport.connect().await {
            self.set_state(ConnectionState::Disconnected);
            let status = e.status();
            error!(%status, "Failed to connect: {}", e);
            self.registry.publish(WearEvent::ConnectionFailed { status });
            return status;
        }

        self.set_state(ConnectionState::Connected);
        info!(node = %self.transport.local_node().id, "Connected");
        self.registry.publish(WearEvent::Connected);

        if !self.initial_capabilities.is_empty() {
            let names: Vec<&str> = self.initial_capabilities.iter().map(String::as_str).collect();
            self.data_layer.add_capabilities(&names).await;
        }
        self.fetch_initial_state().await;
        StatusCode::Success
    }

    async fn fetch_initial_state(&self) {
        match self.transport.connected_nodes().await {
            Ok(nodes) => {
                self.directory.replace_nodes(nodes.iter().cloned());
                let nodes: HashSet<Node> = nodes.into_iter().collect();
                info!("Initial node set: {} nodes", nodes.len());
                self.registry.publish(WearEvent::InitialNodesReceived { nodes });
            }
            Err(e) => error!("Failed to fetch connected nodes: {}", e),
        }

        match self.transport.all_capabilities().await {
            Ok(capabilities) => {
                debug!("Initial capability map: {} capabilities", capabilities.len());
                self.directory.replace_capabilities(capabilities);
                self.registry.publish(WearEvent::InitialCapabilitiesReceived);
            }
            Err(e) => error!("Failed to fetch capabilities: {}", e),
        }
    }

    /// Disconnect from the transport. Returns false if already disconnected.
    pub async fn disconnect(&self) -> bool {
        let previous = self.set_state(ConnectionState::Disconnected);
        self.transport.disconnect().await;
        self.directory.clear();
        if previous == ConnectionState::Disconnected {
            return false;
        }
        info!("Disconnected");
        self.registry.publish(WearEvent::Disconnected);
        true
    }

    /// Apply a connection, peer or capability notification. Returns false for
    /// events this manager does not own.
    pub fn handle_event(&self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::ConnectionSuspended => {
                self.set_state(ConnectionState::Disconnected);
                self.directory.clear();
                warn!("Connection suspended");
                self.registry.publish(WearEvent::ConnectionSuspended);
            }
            TransportEvent::PeerConnected(node) => {
                self.directory.peer_connected(node.clone());
                self.registry.publish(WearEvent::PeerConnected { node: node.clone() });
            }
            TransportEvent::PeerDisconnected(node) => {
                self.directory.peer_disconnected(node);
                self.registry.publish(WearEvent::PeerDisconnected { node: node.clone() });
            }
            TransportEvent::ConnectedNodes(nodes) => {
                self.directory.replace_nodes(nodes.iter().cloned());
                self.registry.publish(WearEvent::ConnectedNodes { nodes: nodes.clone() });
            }
            TransportEvent::CapabilityChanged { capability, nodes } => {
                self.directory.set_capability(capability.clone(), nodes.clone());
                self.registry.publish(WearEvent::CapabilityChanged {
                    capability: capability.clone(),
                    nodes: nodes.clone(),
                });
            }
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;
    use crate::infrastructure::{ChannelConsumer, SimNetwork};
    use tokio::runtime::Handle;

    fn manager(
        network: &SimNetwork,
        id: &str,
        capabilities: Vec<String>,
    ) -> (ConnectionManager, Arc<ConsumerRegistry>, Arc<NodeDirectory>) {
        let (endpoint, _rx) = network.add_node(Node::new(id, id, true));
        let registry = Arc::new(ConsumerRegistry::new());
        let directory = Arc::new(NodeDirectory::new());
        let data_layer = Arc::new(DataLayer::new(endpoint.clone(), registry.clone(), Handle::current()));
        let manager = ConnectionManager::new(endpoint, registry.clone(), directory.clone(), data_layer, capabilities);
        (manager, registry, directory)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let network = SimNetwork::new();
        let (manager, registry, _) = manager(&network, "phone", vec![]);
        let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::Connected]);
        registry.add_consumer(consumer.clone());

        assert_eq!(manager.connect().await, StatusCode::Success);
        assert_eq!(manager.connect().await, StatusCode::Success);
        assert!(manager.is_connected());

        assert!(matches!(rx.recv().await, Some(WearEvent::Connected)));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_reports_status() {
        let network = SimNetwork::new();
        network.set_available(false);
        let (manager, registry, _) = manager(&network, "phone", vec![]);
        let (consumer, mut rx) = ChannelConsumer::with_kinds(&[EventKind::ConnectionFailed]);
        registry.add_consumer(consumer.clone());

        assert_eq!(manager.connect().await, StatusCode::ApiNotConnected);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            rx.recv().await,
            Some(WearEvent::ConnectionFailed { status: StatusCode::ApiNotConnected })
        ));
    }

    #[tokio::test]
    async fn test_initial_state_fetched_on_connect() {
        let network = SimNetwork::new();
        let (watch, _watch_rx) = network.add_node(Node::new("watch", "Watch", true));
        watch.connect().await.unwrap();
        watch.add_local_capability("voice").await.unwrap();

        let (manager, _registry, directory) = manager(&network, "phone", vec!["display".to_string()]);
        manager.connect().await;

        assert_eq!(directory.connected_nodes().len(), 1);
        assert_eq!(directory.nodes_for_capability("voice").len(), 1);

        assert!(manager.disconnect().await);
        assert!(!manager.disconnect().await);
        assert!(directory.connected_nodes().is_empty());
    }
}
