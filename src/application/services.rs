use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::*;
use crate::data_layer::{self, DataLayer};
use crate::discovery::NodeDirectory;
use crate::file_transfer::{OutgoingStream, TransferEngine};
use crate::infrastructure::{config::AppConfig, events::ConsumerRegistry};
use crate::messaging::Messenger;
use crate::network::ConnectionManager;
use crate::utils::dispatch_scope;

/// Entry point of the library: wires the transport to the managers and the
/// consumer registry, and dispatches transport events.
///
/// Constructed explicitly and shared through an `Arc`; there is no global
/// instance. Every asynchronous operation returns its result and also
/// publishes it to the consumers subscribed to its [`EventKind`].
pub struct WearService {
    config: Arc<AppConfig>,
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    directory: Arc<NodeDirectory>,
    connection: ConnectionManager,
    messenger: Messenger,
    data_layer: Arc<DataLayer>,
    transfers: Arc<TransferEngine>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl WearService {
    /// Create a new service with all dependencies wired up.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        config.validate().map_err(|e| e.to_string())?;
        config.ensure_directories()?;
        let config = Arc::new(config);

        let runtime = Handle::current();
        let registry = Arc::new(ConsumerRegistry::with_runtime(runtime.clone()));
        let directory = Arc::new(NodeDirectory::new());
        let data_layer = Arc::new(DataLayer::new(transport.clone(), registry.clone(), runtime));
        let connection = ConnectionManager::new(
            transport.clone(),
            registry.clone(),
            directory.clone(),
            data_layer.clone(),
            config.initial_capabilities.clone(),
        );
        let messenger = Messenger::new(
            transport.clone(),
            registry.clone(),
            directory.clone(),
            config.max_message_bytes,
        );
        let transfers = Arc::new(TransferEngine::new(
            transport.clone(),
            registry.clone(),
            directory.clone(),
            config.download_dir_path(),
            config.copy_buffer_bytes,
        ));

        Ok(Arc::new(Self {
            config,
            transport,
            registry,
            directory,
            connection,
            messenger,
            data_layer,
            transfers,
            events_rx: Mutex::new(Some(events_rx)),
            dispatch: Mutex::new(None),
        }))
    }

    /// Spawn the dispatch loop. Returns false if it was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return false;
        };

        let service: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(dispatch_scope(async move {
            while let Some(event) = rx.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.dispatch(event).await;
            }
            debug!("Dispatch loop stopped");
        }));
        *self.dispatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        true
    }

    async fn dispatch(&self, event: TransportEvent) {
        if matches!(event, TransportEvent::ConnectionSuspended) {
            self.transfers.clear();
        }
        if self.connection.handle_event(&event) {
            return;
        }
        match event {
            TransportEvent::MessageReceived(message) => {
                debug!(path = %message.path, source = %message.source_node_id, "Message received");
                self.registry.publish(WearEvent::MessageReceived(message));
            }
            TransportEvent::DataChanged(batch) => {
                for event in data_layer::data_events(batch) {
                    self.registry.publish(event);
                }
            }
            TransportEvent::ChannelOpened(channel) => {
                self.transfers.handle_channel_opened(channel).await;
            }
            TransportEvent::ChannelClosed {
                channel,
                reason,
                app_error,
            } => {
                self.transfers.handle_channel_closed(&channel, reason).await;
                self.registry.publish(WearEvent::ChannelClosed {
                    channel,
                    reason,
                    app_error,
                });
            }
            TransportEvent::InputClosed {
                channel,
                reason,
                app_error,
            } => {
                self.transfers.handle_input_closed(&channel, reason).await;
                self.registry.publish(WearEvent::InputClosed {
                    channel,
                    reason,
                    app_error,
                });
            }
            TransportEvent::OutputClosed {
                channel,
                reason,
                app_error,
            } => {
                self.transfers.handle_output_closed(&channel, reason).await;
                self.registry.publish(WearEvent::OutputClosed {
                    channel,
                    reason,
                    app_error,
                });
            }
            other => warn!(?other, "Unhandled transport event"),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn local_node(&self) -> Node {
        self.transport.local_node()
    }

    // Connection

    pub async fn connect(&self) -> StatusCode {
        self.connection.connect().await
    }

    /// Clear active transfers and disconnect
    pub async fn disconnect(&self) -> bool {
        self.transfers.clear();
        self.connection.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    // Consumers

    pub fn add_consumer(&self, consumer: Arc<dyn WearConsumer>) -> bool {
        self.registry.add_consumer(consumer)
    }

    pub fn remove_consumer<C: WearConsumer + ?Sized>(&self, consumer: &Arc<C>) -> bool {
        self.registry.remove_consumer(consumer)
    }

    // Nodes

    pub fn connected_nodes(&self) -> HashSet<Node> {
        self.directory.connected_nodes()
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<Node> {
        self.directory.node_by_id(id)
    }

    pub fn nodes_for_capability(&self, capability: &str) -> HashSet<Node> {
        self.directory.nodes_for_capability(capability)
    }

    pub fn nodes_for_capability_filtered(&self, capability: &str, filter: &dyn NodeFilter) -> HashSet<Node> {
        self.directory.nodes_for_capability_filtered(capability, filter)
    }

    pub fn pick_node_for_capability(&self, capability: &str) -> Option<Node> {
        self.directory.pick_node_for_capability(capability)
    }

    // Messaging

    pub async fn send_message(&self, node_id: &NodeId, path: &str, data: &[u8]) -> SendMessageResult {
        self.messenger.send_message(node_id, path, data).await
    }

    pub async fn broadcast_message(&self, path: &str, data: &[u8]) -> Vec<(NodeId, SendMessageResult)> {
        self.messenger.broadcast_message(path, data).await
    }

    pub async fn send_data_map(&self, node_id: &NodeId, path: &str, map: &DataMap) -> SendMessageResult {
        self.messenger.send_data_map(node_id, path, map).await
    }

    pub async fn broadcast_data_map(&self, path: &str, map: &DataMap) -> Vec<(NodeId, SendMessageResult)> {
        self.messenger.broadcast_data_map(path, map).await
    }

    // Records

    pub fn data_layer(&self) -> &DataLayer {
        &self.data_layer
    }

    pub async fn sync(&self, path: &str, key: &str, value: impl Into<DataValue>, urgent: bool) -> StatusCode {
        self.data_layer.sync(path, key, value, urgent).await
    }

    pub async fn sync_asset(&self, path: &str, key: &str, bytes: Vec<u8>, urgent: bool) -> StatusCode {
        self.data_layer.sync_asset(path, key, bytes, urgent).await
    }

    pub async fn sync_data(&self, request: PutDataRequest, urgent: bool) -> StatusCode {
        self.data_layer.sync_data(request, urgent).await
    }

    pub async fn put_data_item(&self, request: PutDataRequest) -> Result<DataItem, TransportError> {
        self.data_layer.put_data_item(request).await
    }

    pub async fn get_data_items(&self) -> Result<Vec<DataItem>, TransportError> {
        self.data_layer.get_data_items().await
    }

    pub async fn get_data_item(&self, path: &str) -> Result<Option<DataItem>, TransportError> {
        self.data_layer.get_data_item(path).await
    }

    pub async fn get_data_items_matching(&self, path: &str, filter: DataFilter) -> Result<Vec<DataItem>, TransportError> {
        self.data_layer.get_data_items_matching(path, filter).await
    }

    pub async fn delete_data_items(&self, path: &str) -> Result<usize, TransportError> {
        self.data_layer.delete_data_items(path).await
    }

    pub async fn delete_data_items_matching(&self, path: &str, filter: DataFilter) -> Result<usize, TransportError> {
        self.data_layer.delete_data_items_matching(path, filter).await
    }

    /// Load an asset from a plain thread, bounded by the configured timeout
    pub fn load_asset_blocking(&self, asset: &Asset) -> Result<Vec<u8>, TransportError> {
        self.data_layer.load_asset_blocking(asset, self.config.blocking_timeout())
    }

    pub fn blocking_timeout(&self) -> Duration {
        self.config.blocking_timeout()
    }

    // Capabilities

    pub async fn add_capabilities(&self, capabilities: &[&str]) -> Vec<(String, StatusCode)> {
        self.data_layer.add_capabilities(capabilities).await
    }

    pub async fn remove_capabilities(&self, capabilities: &[&str]) -> Vec<(String, StatusCode)> {
        self.data_layer.remove_capabilities(capabilities).await
    }

    // Channels and transfers

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub async fn open_channel(&self, node_id: &NodeId, path: &str) -> Result<Channel, TransferError> {
        self.transfers.open_channel(node_id, path).await
    }

    pub async fn close_channel(&self, channel: &Channel) -> Result<(), TransportError> {
        self.transfers.close_channel(channel).await
    }

    pub async fn send_file(
        &self,
        node_id: &NodeId,
        local_path: &Path,
        name: Option<&str>,
        request_id: Option<CorrelationId>,
    ) -> Result<CorrelationId, TransferError> {
        self.transfers.send_file(node_id, local_path, name, request_id).await
    }

    pub async fn send_file_range(
        &self,
        node_id: &NodeId,
        local_path: &Path,
        name: Option<&str>,
        request_id: Option<CorrelationId>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<CorrelationId, TransferError> {
        self.transfers
            .send_file_range(node_id, local_path, name, request_id, offset, length)
            .await
    }

    pub async fn open_output_stream(
        &self,
        node_id: &NodeId,
        request_id: Option<CorrelationId>,
    ) -> Result<OutgoingStream, TransferError> {
        self.transfers.open_output_stream(node_id, request_id).await
    }

    /// Remove the capabilities this service registered and drop every consumer
    pub async fn cleanup(&self) {
        let removed = self.data_layer.remove_watched_capabilities().await;
        if !removed.is_empty() {
            info!("Removed {} watched capabilities", removed.len());
        }
        self.registry.clear();
    }
}

impl Drop for WearService {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
