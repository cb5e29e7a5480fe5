use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::domain::*;
use super::error::TransportError;

/// Result type for consumer handlers
pub type DomainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Readable side of a channel
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of a channel; shutting it down closes the channel output normally
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Events the transport plane delivers on its dispatch queue
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionSuspended,
    PeerConnected(Node),
    PeerDisconnected(Node),
    ConnectedNodes(Vec<Node>),
    CapabilityChanged {
        capability: String,
        nodes: HashSet<Node>,
    },
    MessageReceived(MessageEvent),
    DataChanged(Vec<DataEvent>),
    ChannelOpened(Channel),
    ChannelClosed {
        channel: Channel,
        reason: CloseReason,
        app_error: i32,
    },
    InputClosed {
        channel: Channel,
        reason: CloseReason,
        app_error: i32,
    },
    OutputClosed {
        channel: Channel,
        reason: CloseReason,
        app_error: i32,
    },
}

/// The transport plane: peer discovery, small messages, replicated records and raw channels.
///
/// Implementations own delivery guarantees; callers only orchestrate. Inbound
/// traffic arrives as [`TransportEvent`]s on the receiver handed out when the
/// transport is constructed.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> Node;
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    async fn connected_nodes(&self) -> Result<Vec<Node>, TransportError>;
    async fn all_capabilities(&self) -> Result<HashMap<String, HashSet<Node>>, TransportError>;
    async fn add_local_capability(&self, capability: &str) -> Result<(), TransportError>;
    async fn remove_local_capability(&self, capability: &str) -> Result<(), TransportError>;

    /// Returns the transport-assigned request id
    async fn send_message(&self, node_id: &NodeId, path: &str, data: &[u8]) -> Result<u32, TransportError>;

    async fn put_data_item(&self, request: PutDataRequest) -> Result<DataItem, TransportError>;
    async fn get_data_items(&self) -> Result<Vec<DataItem>, TransportError>;
    async fn get_data_item(&self, path: &str) -> Result<Option<DataItem>, TransportError>;
    /// Returns the number of records removed
    async fn delete_data_items(&self, path: &str, filter: DataFilter) -> Result<usize, TransportError>;
    async fn load_asset(&self, asset: &Asset) -> Result<Vec<u8>, TransportError>;

    async fn open_channel(&self, node_id: &NodeId, path: &str) -> Result<Channel, TransportError>;
    /// Each side of a channel can be taken once
    async fn output_stream(&self, channel: &Channel) -> Result<ChannelWriter, TransportError>;
    async fn input_stream(&self, channel: &Channel) -> Result<ChannelReader, TransportError>;
    async fn close_channel(&self, channel: &Channel) -> Result<(), TransportError>;
}

/// A listener registered with the consumer registry
#[async_trait]
pub trait WearConsumer: Send + Sync {
    /// Event kinds this consumer subscribes to
    fn wants(&self, _kind: EventKind) -> bool {
        true
    }

    async fn handle_event(&self, event: WearEvent) -> DomainResult<()>;
}

/// Predicate used to narrow a node set
pub trait NodeFilter: Send + Sync {
    fn accepts(&self, node: &Node) -> bool;

    fn filter_nodes(&self, nodes: &HashSet<Node>) -> HashSet<Node> {
        nodes.iter().filter(|n| self.accepts(n)).cloned().collect()
    }
}

impl<F> NodeFilter for F
where
    F: Fn(&Node) -> bool + Send + Sync,
{
    fn accepts(&self, node: &Node) -> bool {
        self(node)
    }
}
