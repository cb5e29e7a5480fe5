use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::ChannelReader;

/// Key under which an optional write timestamp (epoch millis) is stored in a record
pub const KEY_TIMESTAMP: &str = "wearlink.KEY_TIMESTAMP";

/// Opaque identifier of a peer node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A peer device participating in the pairing network.
///
/// `is_nearby` is true when the node is reachable over a direct radio link
/// rather than a multi-hop or cloud relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub display_name: String,
    pub is_nearby: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, is_nearby: bool) -> Self {
        Self {
            id: NodeId::new(id),
            display_name: display_name.into(),
            is_nearby,
        }
    }
}

/// Token matching the lifecycle events of one transfer on both sides
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome code of an operation, surfaced to callers and consumers instead of a panic.
///
/// Numeric values follow the wearable platform's common status codes so they
/// can be logged and compared with platform traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    DeveloperError,
    Error,
    Interrupted,
    Timeout,
    Canceled,
    ApiNotConnected,
    TargetNodeNotConnected,
    DataItemTooLarge,
    InvalidTargetNode,
    AssetUnavailable,
    DuplicateCapability,
    UnknownCapability,
}

impl StatusCode {
    pub fn code(&self) -> i32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::DeveloperError => 10,
            StatusCode::Error => 13,
            StatusCode::Interrupted => 14,
            StatusCode::Timeout => 15,
            StatusCode::Canceled => 16,
            StatusCode::ApiNotConnected => 17,
            StatusCode::TargetNodeNotConnected => 4000,
            StatusCode::DataItemTooLarge => 4003,
            StatusCode::InvalidTargetNode => 4004,
            StatusCode::AssetUnavailable => 4005,
            StatusCode::DuplicateCapability => 4006,
            StatusCode::UnknownCapability => 4007,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Why one side of a channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    Normal,
    Disconnected,
    RemoteClose,
    LocalClose,
}

impl CloseReason {
    pub fn code(&self) -> i32 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Disconnected => 1,
            CloseReason::RemoteClose => 2,
            CloseReason::LocalClose => 3,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, CloseReason::Normal)
    }
}

/// Binary blob attached to a record, identified by the SHA-256 of its content.
///
/// `data` is present on the producing side; the transport detaches it into its
/// blob store and records only the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub digest: String,
    pub data: Option<Vec<u8>>,
}

impl Asset {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            digest: crate::utils::sha256_hex(&bytes),
            data: Some(bytes),
        }
    }

    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            data: None,
        }
    }

    /// Same asset without its inline bytes
    pub fn detached(&self) -> Self {
        Self::from_digest(self.digest.clone())
    }
}

/// A typed value stored under a key of a [`DataMap`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Bool(bool),
    Byte(i8),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    ByteArray(Vec<u8>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
    IntList(Vec<i32>),
    StringList(Vec<String>),
    Asset(Asset),
    Map(DataMap),
}

macro_rules! data_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DataValue {
                fn from(value: $ty) -> Self {
                    DataValue::$variant(value)
                }
            }
        )*
    };
}

data_value_from! {
    bool => Bool,
    i8 => Byte,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<u8> => ByteArray,
    Vec<i64> => LongArray,
    Vec<f32> => FloatArray,
    Vec<i32> => IntList,
    Vec<String> => StringList,
    Asset => Asset,
    DataMap => Map,
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::String(value.to_string())
    }
}

/// Ordered key/value entries of a sync record or structured message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMap {
    entries: Vec<(String, DataValue)>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing (in place) any value already stored under `key`
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<DataValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<DataValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(DataValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(DataValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(DataValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(DataValue::Long(l)) => Some(*l),
            _ => None,
        }
    }

    pub fn get_asset(&self, key: &str) -> Option<&Asset> {
        match self.get(key) {
            Some(DataValue::Asset(a)) => Some(a),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut DataValue)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode for use as a message payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (map, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(map)
    }
}

/// A record to be written into the replicated store
#[derive(Debug, Clone, PartialEq)]
pub struct PutDataRequest {
    pub path: String,
    pub data: DataMap,
    pub urgent: bool,
}

impl PutDataRequest {
    pub fn create(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: DataMap::new(),
            urgent: false,
        }
    }

    pub fn data_mut(&mut self) -> &mut DataMap {
        &mut self.data
    }

    /// Hint the transport to deliver this record with priority
    pub fn set_urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.data.put(KEY_TIMESTAMP, crate::utils::timestamp_millis());
        self
    }
}

/// A record as stored in, and reported by, the replicated store
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub path: String,
    pub data: DataMap,
    pub source_node_id: NodeId,
}

/// How a record path selects records in get and delete queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFilter {
    /// Only the record at exactly this path
    #[default]
    Literal,
    /// Every record whose path starts with this path
    Prefix,
}

impl DataFilter {
    pub fn matches(&self, query: &str, path: &str) -> bool {
        match self {
            DataFilter::Literal => path == query,
            DataFilter::Prefix => path.starts_with(query),
        }
    }
}

/// A change notification from the replicated store
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    Changed(DataItem),
    Deleted { path: String },
}

/// A small message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub path: String,
    pub data: Vec<u8>,
    pub source_node_id: NodeId,
    pub request_id: u32,
}

/// Outcome of one unicast send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMessageResult {
    pub status: StatusCode,
    pub request_id: Option<u32>,
}

/// Handle of a bidirectional byte channel opened against a logical path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub token: String,
    pub node_id: NodeId,
    pub path: String,
}

/// How the bytes of a transfer are carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    File,
    Stream,
}

/// Transfer session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Opening,
    Streaming,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferStatus::Completed => StatusCode::Success,
            _ => StatusCode::Error,
        }
    }
}

/// Final report of a transfer session on the receiving side
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub mode: TransferMode,
    pub status: TransferStatus,
    pub request_id: CorrelationId,
    /// Local file the bytes were written to; `None` in stream mode
    pub file: Option<PathBuf>,
    pub name: Option<String>,
    pub declared_bytes: Option<u64>,
    pub received_bytes: u64,
}

impl TransferOutcome {
    pub fn status_code(&self) -> StatusCode {
        self.status.status_code()
    }
}

/// Input side of a stream-mode channel, shared by every consumer of one event.
///
/// The first consumer to call [`take`](Self::take) owns the reader and is
/// responsible for draining it.
#[derive(Clone)]
pub struct InputStreamHandle {
    inner: Arc<Mutex<Option<ChannelReader>>>,
}

impl InputStreamHandle {
    pub fn new(reader: Option<ChannelReader>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reader)),
        }
    }

    pub async fn take(&self) -> Option<ChannelReader> {
        self.inner.lock().await.take()
    }
}

impl fmt::Debug for InputStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStreamHandle").finish_non_exhaustive()
    }
}

/// Every event a consumer can observe
#[derive(Debug, Clone)]
pub enum WearEvent {
    Connected,
    ConnectionSuspended,
    ConnectionFailed { status: StatusCode },
    Disconnected,
    InitialNodesReceived { nodes: HashSet<Node> },
    InitialCapabilitiesReceived,
    PeerConnected { node: Node },
    PeerDisconnected { node: Node },
    ConnectedNodes { nodes: Vec<Node> },
    CapabilityChanged { capability: String, nodes: HashSet<Node> },
    AddCapabilityResult { capability: String, status: StatusCode },
    RemoveCapabilityResult { capability: String, status: StatusCode },
    MessageReceived(MessageEvent),
    SendMessageResult { node_id: NodeId, path: String, result: SendMessageResult },
    DataChanged(DataItem),
    DataDeleted { path: String },
    SendDataResult { path: String, status: StatusCode },
    GetDataItems { status: StatusCode, items: Vec<DataItem> },
    GetDataItem { status: StatusCode, item: Option<DataItem> },
    DeleteDataItemsResult { path: String, status: StatusCode, deleted: usize },
    ChannelOpened { channel: Channel },
    ChannelClosed { channel: Channel, reason: CloseReason, app_error: i32 },
    InputClosed { channel: Channel, reason: CloseReason, app_error: i32 },
    OutputClosed { channel: Channel, reason: CloseReason, app_error: i32 },
    InputStreamOpened {
        status: StatusCode,
        request_id: CorrelationId,
        channel: Channel,
        stream: InputStreamHandle,
    },
    SendFileResult { status: StatusCode, request_id: CorrelationId },
    TransferFinished(TransferOutcome),
}

/// Discriminant of [`WearEvent`], used by consumers to subscribe to kinds of events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    ConnectionSuspended,
    ConnectionFailed,
    Disconnected,
    InitialNodesReceived,
    InitialCapabilitiesReceived,
    PeerConnected,
    PeerDisconnected,
    ConnectedNodes,
    CapabilityChanged,
    AddCapabilityResult,
    RemoveCapabilityResult,
    MessageReceived,
    SendMessageResult,
    DataChanged,
    DataDeleted,
    SendDataResult,
    GetDataItems,
    GetDataItem,
    DeleteDataItemsResult,
    ChannelOpened,
    ChannelClosed,
    InputClosed,
    OutputClosed,
    InputStreamOpened,
    SendFileResult,
    TransferFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 27] = [
        EventKind::Connected,
        EventKind::ConnectionSuspended,
        EventKind::ConnectionFailed,
        EventKind::Disconnected,
        EventKind::InitialNodesReceived,
        EventKind::InitialCapabilitiesReceived,
        EventKind::PeerConnected,
        EventKind::PeerDisconnected,
        EventKind::ConnectedNodes,
        EventKind::CapabilityChanged,
        EventKind::AddCapabilityResult,
        EventKind::RemoveCapabilityResult,
        EventKind::MessageReceived,
        EventKind::SendMessageResult,
        EventKind::DataChanged,
        EventKind::DataDeleted,
        EventKind::SendDataResult,
        EventKind::GetDataItems,
        EventKind::GetDataItem,
        EventKind::DeleteDataItemsResult,
        EventKind::ChannelOpened,
        EventKind::ChannelClosed,
        EventKind::InputClosed,
        EventKind::OutputClosed,
        EventKind::InputStreamOpened,
        EventKind::SendFileResult,
        EventKind::TransferFinished,
    ];
}

impl WearEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WearEvent::Connected => EventKind::Connected,
            WearEvent::ConnectionSuspended => EventKind::ConnectionSuspended,
            WearEvent::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            WearEvent::Disconnected => EventKind::Disconnected,
            WearEvent::InitialNodesReceived { .. } => EventKind::InitialNodesReceived,
            WearEvent::InitialCapabilitiesReceived => EventKind::InitialCapabilitiesReceived,
            WearEvent::PeerConnected { .. } => EventKind::PeerConnected,
            WearEvent::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            WearEvent::ConnectedNodes { .. } => EventKind::ConnectedNodes,
            WearEvent::CapabilityChanged { .. } => EventKind::CapabilityChanged,
            WearEvent::AddCapabilityResult { .. } => EventKind::AddCapabilityResult,
            WearEvent::RemoveCapabilityResult { .. } => EventKind::RemoveCapabilityResult,
            WearEvent::MessageReceived(_) => EventKind::MessageReceived,
            WearEvent::SendMessageResult { .. } => EventKind::SendMessageResult,
            WearEvent::DataChanged(_) => EventKind::DataChanged,
            WearEvent::DataDeleted { .. } => EventKind::DataDeleted,
            WearEvent::SendDataResult { .. } => EventKind::SendDataResult,
            WearEvent::GetDataItems { .. } => EventKind::GetDataItems,
            WearEvent::GetDataItem { .. } => EventKind::GetDataItem,
            WearEvent::DeleteDataItemsResult { .. } => EventKind::DeleteDataItemsResult,
            WearEvent::ChannelOpened { .. } => EventKind::ChannelOpened,
            WearEvent::ChannelClosed { .. } => EventKind::ChannelClosed,
            WearEvent::InputClosed { .. } => EventKind::InputClosed,
            WearEvent::OutputClosed { .. } => EventKind::OutputClosed,
            WearEvent::InputStreamOpened { .. } => EventKind::InputStreamOpened,
            WearEvent::SendFileResult { .. } => EventKind::SendFileResult,
            WearEvent::TransferFinished(_) => EventKind::TransferFinished,
        }
    }
}
