//! Small fire-and-forget messages between nodes.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::core::{DataMap, NodeId, SendMessageResult, StatusCode, Transport, WearEvent};
use crate::discovery::NodeDirectory;
use crate::infrastructure::events::ConsumerRegistry;
use crate::utils::check_not_empty;

pub struct Messenger {
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    directory: Arc<NodeDirectory>,
    max_message_bytes: usize,
}

impl Messenger {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConsumerRegistry>,
        directory: Arc<NodeDirectory>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            transport,
            registry,
            directory,
            max_message_bytes,
        }
    }

    /// Send `data` to one node. Never retried; the outcome is also published.
    pub async fn send_message(&self, node_id: &NodeId, path: &str, data: &[u8]) -> SendMessageResult {
        let result = self.try_send(node_id, path, data).await;
        self.registry.publish(WearEvent::SendMessageResult {
            node_id: node_id.clone(),
            path: path.to_string(),
            result,
        });
        result
    }

    async fn try_send(&self, node_id: &NodeId, path: &str, data: &[u8]) -> SendMessageResult {
        let failed = |status| SendMessageResult {
            status,
            request_id: None,
        };

        if !check_not_empty(path, "path") || !check_not_empty(node_id.as_str(), "node_id") {
            return failed(StatusCode::DeveloperError);
        }
        if !self.transport.is_connected() {
            error!(%node_id, %path, "Failed to send message: not connected");
            return failed(StatusCode::ApiNotConnected);
        }
        if data.len() > self.max_message_bytes {
            warn!(
                %path,
                "Message payload of {} bytes exceeds the recommended {} bytes",
                data.len(),
                self.max_message_bytes
            );
        }

        match self.transport.send_message(node_id, path, data).await {
            Ok(request_id) => {
                debug!(%node_id, %path, request_id, "Message sent");
                SendMessageResult {
                    status: StatusCode::Success,
                    request_id: Some(request_id),
                }
            }
            Err(e) => {
                error!(%node_id, %path, "Failed to send message: {}", e);
                failed(e.status())
            }
        }
    }

    /// Send `data` to every nearby node concurrently
    pub async fn broadcast_message(&self, path: &str, data: &[u8]) -> Vec<(NodeId, SendMessageResult)> {
        if !self.transport.is_connected() {
            error!(%path, "Failed to broadcast message: not connected");
            return Vec::new();
        }

        let mut targets: Vec<NodeId> = self.directory.nearby_nodes().into_iter().map(|n| n.id).collect();
        targets.sort();
        if targets.is_empty() {
            debug!(%path, "No nearby nodes to broadcast to");
        }

        let results = join_all(targets.iter().map(|id| self.send_message(id, path, data))).await;
        targets.into_iter().zip(results).collect()
    }

    pub async fn send_data_map(&self, node_id: &NodeId, path: &str, map: &DataMap) -> SendMessageResult {
        match map.to_bytes() {
            Ok(bytes) => self.send_message(node_id, path, &bytes).await,
            Err(e) => {
                error!(%path, "Failed to encode message payload: {}", e);
                SendMessageResult {
                    status: StatusCode::DeveloperError,
                    request_id: None,
                }
            }
        }
    }

    pub async fn broadcast_data_map(&self, path: &str, map: &DataMap) -> Vec<(NodeId, SendMessageResult)> {
        match map.to_bytes() {
            Ok(bytes) => self.broadcast_message(path, &bytes).await,
            Err(e) => {
                error!(%path, "Failed to encode message payload: {}", e);
                Vec::new()
            }
        }
    }
}
