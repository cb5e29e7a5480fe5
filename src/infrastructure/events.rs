use crate::core::{
    domain::{EventKind, WearEvent},
    traits::{DomainResult, WearConsumer},
};
use crate::utils::dispatch_scope;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct Registration {
    id: usize,
    consumer: Weak<dyn WearConsumer>,
    kinds: HashSet<EventKind>,
    queue: mpsc::UnboundedSender<WearEvent>,
}

struct RegistryState {
    registrations: Vec<Registration>,
    connected: bool,
}

/// Fan-out of [`WearEvent`]s to registered consumers.
///
/// Each consumer gets its own queue drained by its own task, so events reach a
/// consumer in publish order and a handler may call back into the registry (or
/// the service) without blocking other consumers. The registry keeps only weak
/// references; a dropped consumer is pruned on the next publish.
///
/// The connected flag lives under the same lock as the consumer list: a
/// consumer added while connected has a synthetic [`WearEvent::Connected`]
/// queued before it can observe anything else, and exactly once.
pub struct ConsumerRegistry {
    state: Mutex<RegistryState>,
    runtime: Handle,
}

fn identity<C: ?Sized>(consumer: &Arc<C>) -> usize {
    Arc::as_ptr(consumer).cast::<()>() as usize
}

impl ConsumerRegistry {
    /// Must be called from within a tokio runtime; delivery tasks are spawned on it
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                registrations: Vec::new(),
                connected: false,
            }),
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a consumer. Returns false if it was already registered.
    ///
    /// Only a weak reference is kept; the caller owns the consumer's lifetime.
    pub fn add_consumer(&self, consumer: Arc<dyn WearConsumer>) -> bool {
        let id = identity(&consumer);
        let kinds: HashSet<EventKind> = EventKind::ALL
            .iter()
            .copied()
            .filter(|kind| consumer.wants(*kind))
            .collect();
        let (queue, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.lock();
            state.registrations.retain(|r| r.consumer.strong_count() > 0);
            if state.registrations.iter().any(|r| r.id == id) {
                return false;
            }
            // Consumers added after the connection came up would otherwise never see it
            if state.connected && kinds.contains(&EventKind::Connected) {
                let _ = queue.send(WearEvent::Connected);
            }
            state.registrations.push(Registration {
                id,
                consumer: Arc::downgrade(&consumer),
                kinds,
                queue,
            });
        }

        self.runtime.spawn(dispatch_scope(deliver(rx, Arc::downgrade(&consumer))));
        debug!(consumer = id, "consumer registered");
        true
    }

    /// Unregister a consumer. Events already queued for it are still delivered.
    pub fn remove_consumer<C: WearConsumer + ?Sized>(&self, consumer: &Arc<C>) -> bool {
        let id = identity(consumer);
        let mut state = self.lock();
        let before = state.registrations.len();
        state.registrations.retain(|r| r.id != id);
        before != state.registrations.len()
    }

    pub fn clear(&self) {
        self.lock().registrations.clear();
    }

    pub fn len(&self) -> usize {
        self.lock()
            .registrations
            .iter()
            .filter(|r| r.consumer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connection state as last published
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Queue `event` for every live consumer subscribed to its kind
    pub fn publish(&self, event: WearEvent) {
        let kind = event.kind();
        let mut state = self.lock();
        match kind {
            EventKind::Connected => state.connected = true,
            EventKind::Disconnected | EventKind::ConnectionSuspended | EventKind::ConnectionFailed => {
                state.connected = false
            }
            _ => {}
        }

        state.registrations.retain(|registration| {
            if registration.consumer.strong_count() == 0 {
                return false;
            }
            if !registration.kinds.contains(&kind) {
                return true;
            }
            registration.queue.send(event.clone()).is_ok()
        });
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<WearEvent>, consumer: Weak<dyn WearConsumer>) {
    while let Some(event) = rx.recv().await {
        let Some(consumer) = consumer.upgrade() else {
            break;
        };
        let kind = event.kind();
        if let Err(e) = consumer.handle_event(event).await {
            error!(?kind, "Error in event handler: {}", e);
        }
    }
}

/// Consumer forwarding every subscribed event into a channel
pub struct ChannelConsumer {
    event_tx: mpsc::UnboundedSender<WearEvent>,
    kinds: Option<HashSet<EventKind>>,
}

impl ChannelConsumer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WearEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { event_tx, kinds: None }), event_rx)
    }

    /// Subscribe only to the given kinds
    pub fn with_kinds(kinds: &[EventKind]) -> (Arc<Self>, mpsc::UnboundedReceiver<WearEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let consumer = Self {
            event_tx,
            kinds: Some(kinds.iter().copied().collect()),
        };
        (Arc::new(consumer), event_rx)
    }
}

#[async_trait]
impl WearConsumer for ChannelConsumer {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }

    async fn handle_event(&self, event: WearEvent) -> DomainResult<()> {
        self.event_tx
            .send(event)
            .map_err(|e| format!("Failed to forward event: {}", e).into())
    }
}

/// Consumer logging every event
pub struct LoggingConsumer;

#[async_trait]
impl WearConsumer for LoggingConsumer {
    async fn handle_event(&self, event: WearEvent) -> DomainResult<()> {
        match &event {
            WearEvent::Connected => info!("Connected to the transport"),
            WearEvent::ConnectionSuspended => warn!("Connection suspended"),
            WearEvent::ConnectionFailed { status } => error!(%status, "Connection failed"),
            WearEvent::Disconnected => info!("Disconnected"),
            WearEvent::InitialNodesReceived { nodes } => {
                info!("Initial node set received: {} nodes", nodes.len())
            }
            WearEvent::PeerConnected { node } => info!("Peer connected: {}", node.id),
            WearEvent::PeerDisconnected { node } => info!("Peer disconnected: {}", node.id),
            WearEvent::CapabilityChanged { capability, nodes } => {
                info!("Capability {} now on {} nodes", capability, nodes.len())
            }
            WearEvent::MessageReceived(message) => info!(
                path = %message.path,
                source = %message.source_node_id,
                "Message received ({} bytes)",
                message.data.len()
            ),
            WearEvent::SendMessageResult { node_id, path, result } => {
                info!(%node_id, %path, status = %result.status, "Message sent")
            }
            WearEvent::DataChanged(item) => info!(path = %item.path, "Data changed"),
            WearEvent::DataDeleted { path } => info!(%path, "Data deleted"),
            WearEvent::ChannelOpened { channel } => info!(path = %channel.path, "Channel opened"),
            WearEvent::SendFileResult { status, request_id } => {
                info!(%request_id, %status, "File send finished")
            }
            WearEvent::TransferFinished(outcome) => info!(
                request_id = %outcome.request_id,
                status = ?outcome.status,
                "Transfer finished: {} of {:?} bytes",
                outcome.received_bytes,
                outcome.declared_bytes
            ),
            other => debug!(kind = ?other.kind(), "Event"),
        }
        Ok(())
    }
}
