//! In-process simulated network implementing the [`Transport`] trait.
//!
//! Every node added to a [`SimNetwork`] gets a [`SimEndpoint`] and the receiving
//! half of its event queue. Messages, record changes and channel lifecycle
//! events are routed between endpoints synchronously; channel bytes travel over
//! unbounded chunk queues.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{
    Asset, Channel, ChannelReader, ChannelWriter, CloseReason, DataEvent, DataFilter, DataItem, DataMap, DataValue, Node,
    NodeId, PutDataRequest, Transport, TransportError, TransportEvent,
};
use crate::utils::generate_id;

struct EndpointState {
    node: Node,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: bool,
    capabilities: HashSet<String>,
}

/// One direction of a channel; each half can be taken once
struct Pipe {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

struct ChannelRecord {
    path: String,
    opener: NodeId,
    acceptor: NodeId,
    opener_to_acceptor: Pipe,
    acceptor_to_opener: Pipe,
    opener_closed: bool,
    acceptor_closed: bool,
}

impl ChannelRecord {
    fn peer_of(&self, node: &NodeId) -> Option<&NodeId> {
        if *node == self.opener {
            Some(&self.acceptor)
        } else if *node == self.acceptor {
            Some(&self.opener)
        } else {
            None
        }
    }

    /// (outgoing, incoming) pipes as seen from `node`
    fn pipes_mut(&mut self, node: &NodeId) -> (&mut Pipe, &mut Pipe) {
        if *node == self.opener {
            (&mut self.opener_to_acceptor, &mut self.acceptor_to_opener)
        } else {
            (&mut self.acceptor_to_opener, &mut self.opener_to_acceptor)
        }
    }
}

#[derive(Default)]
struct SimState {
    endpoints: HashMap<NodeId, EndpointState>,
    store: BTreeMap<String, DataItem>,
    blobs: HashMap<String, Vec<u8>>,
    channels: HashMap<String, ChannelRecord>,
}

impl SimState {
    fn emit(&self, node: &NodeId, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(node) {
            if endpoint.connected {
                let _ = endpoint.events.send(event);
            }
        }
    }

    fn emit_to_others(&self, except: &NodeId, event: TransportEvent) {
        for endpoint in self.endpoints.values() {
            if endpoint.connected && endpoint.node.id != *except {
                let _ = endpoint.events.send(event.clone());
            }
        }
    }

    fn emit_to_all(&self, event: TransportEvent) {
        for endpoint in self.endpoints.values().filter(|e| e.connected) {
            let _ = endpoint.events.send(event.clone());
        }
    }

    fn require_connected(&self, node: &NodeId) -> Result<(), TransportError> {
        match self.endpoints.get(node) {
            Some(endpoint) if endpoint.connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn connected_peer(&self, node: &NodeId) -> Result<&EndpointState, TransportError> {
        match self.endpoints.get(node) {
            Some(endpoint) if endpoint.connected => Ok(endpoint),
            _ => Err(TransportError::TargetNodeNotConnected(node.clone())),
        }
    }

    /// Connected nodes advertising `capability`, as seen from `viewer`
    fn capability_nodes(&self, capability: &str, viewer: &NodeId) -> HashSet<Node> {
        self.endpoints
            .values()
            .filter(|e| e.connected && e.node.id != *viewer && e.capabilities.contains(capability))
            .map(|e| e.node.clone())
            .collect()
    }

    fn announce_capability(&self, capability: &str, owner: &NodeId) {
        for endpoint in self.endpoints.values() {
            if endpoint.connected && endpoint.node.id != *owner {
                let _ = endpoint.events.send(TransportEvent::CapabilityChanged {
                    capability: capability.to_string(),
                    nodes: self.capability_nodes(capability, &endpoint.node.id),
                });
            }
        }
    }
}

struct SimShared {
    state: Mutex<SimState>,
    available: AtomicBool,
    next_request_id: AtomicU32,
    /// Delay applied to record store and asset round trips
    latency_ms: AtomicU64,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared medium connecting simulated nodes
#[derive(Clone)]
pub struct SimNetwork {
    shared: Arc<SimShared>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState::default()),
                available: AtomicBool::new(true),
                next_request_id: AtomicU32::new(1),
                latency_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a node. The returned receiver carries every event routed to it.
    pub fn add_node(&self, node: Node) -> (Arc<SimEndpoint>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        if state.endpoints.contains_key(&node.id) {
            warn!(node = %node.id, "Replacing simulated node with the same id");
        }
        state.endpoints.insert(
            node.id.clone(),
            EndpointState {
                node: node.clone(),
                events,
                connected: false,
                capabilities: HashSet::new(),
            },
        );
        debug!(node = %node.id, nearby = node.is_nearby, "Simulated node added");

        let endpoint = Arc::new(SimEndpoint {
            node,
            shared: self.shared.clone(),
        });
        (endpoint, events_rx)
    }

    /// When false, every subsequent `connect` fails with [`TransportError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of channels with at least one side still open
    pub fn open_channel_count(&self) -> usize {
        self.shared.lock().channels.len()
    }
}

/// One node's handle on a [`SimNetwork`]
pub struct SimEndpoint {
    node: Node,
    shared: Arc<SimShared>,
}

impl SimEndpoint {
    pub fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    /// Simulate the platform suspending this node's connection
    pub fn suspend(&self) {
        let mut state = self.shared.lock();
        state.emit(&self.node.id, TransportEvent::ConnectionSuspended);
        if let Some(endpoint) = state.endpoints.get_mut(&self.node.id) {
            endpoint.connected = false;
        }
        state.emit_to_others(&self.node.id, TransportEvent::PeerDisconnected(self.node.clone()));
    }

    async fn store_round_trip(&self) {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn channel_view(&self, token: &str, peer: &NodeId, path: &str) -> Channel {
        Channel {
            token: token.to_string(),
            node_id: peer.clone(),
            path: path.to_string(),
        }
    }
}

fn detach_assets(map: &mut DataMap, blobs: &mut HashMap<String, Vec<u8>>) {
    for (_, value) in map.iter_mut() {
        match value {
            DataValue::Asset(asset) => {
                if let Some(bytes) = asset.data.take() {
                    blobs.insert(asset.digest.clone(), bytes);
                }
            }
            DataValue::Map(nested) => detach_assets(nested, blobs),
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for SimEndpoint {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        let mut state = self.shared.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.node.id)
            .ok_or_else(|| TransportError::Failed(format!("node {} is not attached", self.node.id)))?;
        if endpoint.connected {
            return Ok(());
        }
        endpoint.connected = true;
        state.emit_to_others(&self.node.id, TransportEvent::PeerConnected(self.node.clone()));
        debug!(node = %self.node.id, "Simulated node connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.shared.lock();
        let was_connected = match state.endpoints.get_mut(&self.node.id) {
            Some(endpoint) => std::mem::replace(&mut endpoint.connected, false),
            None => false,
        };
        if was_connected {
            state.emit_to_others(&self.node.id, TransportEvent::PeerDisconnected(self.node.clone()));
            debug!(node = %self.node.id, "Simulated node disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().require_connected(&self.node.id).is_ok()
    }

    async fn connected_nodes(&self) -> Result<Vec<Node>, TransportError> {
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        let mut nodes: Vec<Node> = state
            .endpoints
            .values()
            .filter(|e| e.connected && e.node.id != self.node.id)
            .map(|e| e.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn all_capabilities(&self) -> Result<HashMap<String, HashSet<Node>>, TransportError> {
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        let names: HashSet<&String> = state
            .endpoints
            .values()
            .filter(|e| e.connected && e.node.id != self.node.id)
            .flat_map(|e| e.capabilities.iter())
            .collect();
        Ok(names
            .into_iter()
            .map(|name| (name.clone(), state.capability_nodes(name, &self.node.id)))
            .collect())
    }

    async fn add_local_capability(&self, capability: &str) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        let inserted = state
            .endpoints
            .get_mut(&self.node.id)
            .map(|e| e.capabilities.insert(capability.to_string()))
            .unwrap_or(false);
        if !inserted {
            return Err(TransportError::DuplicateCapability(capability.to_string()));
        }
        state.announce_capability(capability, &self.node.id);
        Ok(())
    }

    async fn remove_local_capability(&self, capability: &str) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        let removed = state
            .endpoints
            .get_mut(&self.node.id)
            .map(|e| e.capabilities.remove(capability))
            .unwrap_or(false);
        if !removed {
            return Err(TransportError::UnknownCapability(capability.to_string()));
        }
        state.announce_capability(capability, &self.node.id);
        Ok(())
    }

    async fn send_message(&self, node_id: &NodeId, path: &str, data: &[u8]) -> Result<u32, TransportError> {
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        let target = state.connected_peer(node_id)?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let _ = target.events.send(TransportEvent::MessageReceived(crate::core::MessageEvent {
            path: path.to_string(),
            data: data.to_vec(),
            source_node_id: self.node.id.clone(),
            request_id,
        }));
        Ok(request_id)
    }

    async fn put_data_item(&self, request: PutDataRequest) -> Result<DataItem, TransportError> {
        self.store_round_trip().await;
        let mut state = self.shared.lock();
        state.require_connected(&self.node.id)?;

        let PutDataRequest { path, mut data, urgent } = request;
        detach_assets(&mut data, &mut state.blobs);
        let item = DataItem {
            path: path.clone(),
            data,
            source_node_id: self.node.id.clone(),
        };
        state.store.insert(path.clone(), item.clone());
        debug!(%path, urgent, "Record stored");
        state.emit_to_all(TransportEvent::DataChanged(vec![DataEvent::Changed(item.clone())]));
        Ok(item)
    }

    async fn get_data_items(&self) -> Result<Vec<DataItem>, TransportError> {
        self.store_round_trip().await;
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        Ok(state.store.values().cloned().collect())
    }

    async fn get_data_item(&self, path: &str) -> Result<Option<DataItem>, TransportError> {
        self.store_round_trip().await;
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        Ok(state.store.get(path).cloned())
    }

    async fn delete_data_items(&self, path: &str, filter: DataFilter) -> Result<usize, TransportError> {
        self.store_round_trip().await;
        let mut state = self.shared.lock();
        state.require_connected(&self.node.id)?;

        let doomed: Vec<String> = state
            .store
            .keys()
            .filter(|stored| filter.matches(path, stored))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        for stored in &doomed {
            state.store.remove(stored);
        }
        let deleted = doomed.len();
        state.emit_to_all(TransportEvent::DataChanged(
            doomed.into_iter().map(|path| DataEvent::Deleted { path }).collect(),
        ));
        Ok(deleted)
    }

    async fn load_asset(&self, asset: &Asset) -> Result<Vec<u8>, TransportError> {
        self.store_round_trip().await;
        if let Some(bytes) = &asset.data {
            return Ok(bytes.clone());
        }
        let state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        state
            .blobs
            .get(&asset.digest)
            .cloned()
            .ok_or_else(|| TransportError::AssetUnavailable(asset.digest.clone()))
    }

    async fn open_channel(&self, node_id: &NodeId, path: &str) -> Result<Channel, TransportError> {
        let mut state = self.shared.lock();
        state.require_connected(&self.node.id)?;
        state.connected_peer(node_id)?;

        let token = generate_id();
        state.channels.insert(
            token.clone(),
            ChannelRecord {
                path: path.to_string(),
                opener: self.node.id.clone(),
                acceptor: node_id.clone(),
                opener_to_acceptor: Pipe::new(),
                acceptor_to_opener: Pipe::new(),
                opener_closed: false,
                acceptor_closed: false,
            },
        );
        state.emit(
            node_id,
            TransportEvent::ChannelOpened(self.channel_view(&token, &self.node.id, path)),
        );
        debug!(%token, peer = %node_id, %path, "Channel opened");
        Ok(self.channel_view(&token, node_id, path))
    }

    async fn output_stream(&self, channel: &Channel) -> Result<ChannelWriter, TransportError> {
        let mut state = self.shared.lock();
        let record = state
            .channels
            .get_mut(&channel.token)
            .ok_or_else(|| TransportError::ChannelClosed(channel.token.clone()))?;
        let peer = record
            .peer_of(&self.node.id)
            .cloned()
            .ok_or_else(|| TransportError::ChannelClosed(channel.token.clone()))?;
        let path = record.path.clone();
        let (outgoing, _) = record.pipes_mut(&self.node.id);
        let tx = outgoing
            .tx
            .take()
            .ok_or_else(|| TransportError::StreamTaken(channel.token.clone()))?;

        Ok(Box::new(SimChannelWriter {
            tx: Some(tx),
            shared: self.shared.clone(),
            token: channel.token.clone(),
            local: self.node.id.clone(),
            peer,
            path,
        }))
    }

    async fn input_stream(&self, channel: &Channel) -> Result<ChannelReader, TransportError> {
        let mut state = self.shared.lock();
        let record = state
            .channels
            .get_mut(&channel.token)
            .ok_or_else(|| TransportError::ChannelClosed(channel.token.clone()))?;
        if record.peer_of(&self.node.id).is_none() {
            return Err(TransportError::ChannelClosed(channel.token.clone()));
        }
        let (_, incoming) = record.pipes_mut(&self.node.id);
        let rx = incoming
            .rx
            .take()
            .ok_or_else(|| TransportError::StreamTaken(channel.token.clone()))?;

        Ok(Box::new(SimChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        }))
    }

    async fn close_channel(&self, channel: &Channel) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        let Some(record) = state.channels.get_mut(&channel.token) else {
            return Ok(());
        };
        let Some(peer) = record.peer_of(&self.node.id).cloned() else {
            return Err(TransportError::ChannelClosed(channel.token.clone()));
        };

        let already_closed = if self.node.id == record.opener {
            std::mem::replace(&mut record.opener_closed, true)
        } else {
            std::mem::replace(&mut record.acceptor_closed, true)
        };
        if already_closed {
            return Ok(());
        }

        // Untaken halves of this side go away; the peer keeps what it has not read yet
        let (outgoing, incoming) = record.pipes_mut(&self.node.id);
        outgoing.tx = None;
        incoming.rx = None;

        let path = record.path.clone();
        let fully_closed = record.opener_closed && record.acceptor_closed;
        if fully_closed {
            state.channels.remove(&channel.token);
        }

        state.emit(
            &self.node.id,
            TransportEvent::ChannelClosed {
                channel: self.channel_view(&channel.token, &peer, &path),
                reason: CloseReason::LocalClose,
                app_error: 0,
            },
        );
        if !fully_closed {
            state.emit(
                &peer,
                TransportEvent::ChannelClosed {
                    channel: self.channel_view(&channel.token, &self.node.id, &path),
                    reason: CloseReason::RemoteClose,
                    app_error: 0,
                },
            );
        }
        debug!(token = %channel.token, "Channel closed");
        Ok(())
    }
}

/// Writable side of a simulated channel.
///
/// Shutting it down reports a normal close on both ends; dropping it without
/// a shutdown reports an abnormal remote close to the reader.
pub struct SimChannelWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shared: Arc<SimShared>,
    token: String,
    local: NodeId,
    peer: NodeId,
    path: String,
}

impl SimChannelWriter {
    fn finish(&mut self, peer_reason: CloseReason, local_reason: CloseReason) {
        if self.tx.take().is_none() {
            return;
        }
        let state = self.shared.lock();
        state.emit(
            &self.peer,
            TransportEvent::InputClosed {
                channel: Channel {
                    token: self.token.clone(),
                    node_id: self.local.clone(),
                    path: self.path.clone(),
                },
                reason: peer_reason,
                app_error: 0,
            },
        );
        state.emit(
            &self.local,
            TransportEvent::OutputClosed {
                channel: Channel {
                    token: self.token.clone(),
                    node_id: self.peer.clone(),
                    path: self.path.clone(),
                },
                reason: local_reason,
                app_error: 0,
            },
        );
    }
}

impl AsyncWrite for SimChannelWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(tx) = &this.tx else {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel output closed")));
        };
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel input dropped by peer",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().finish(CloseReason::Normal, CloseReason::Normal);
        Poll::Ready(Ok(()))
    }
}

impl Drop for SimChannelWriter {
    fn drop(&mut self) {
        self.finish(CloseReason::RemoteClose, CloseReason::LocalClose);
    }
}

/// Readable side of a simulated channel; reports EOF once the writer is gone
pub struct SimChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl AsyncRead for SimChannelReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
