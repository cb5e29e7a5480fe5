use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::core::{
    Channel, ChannelReader, ChannelWriter, CloseReason, CorrelationId, InputStreamHandle, NodeId, StatusCode,
    TransferError, TransferStatus, Transport, TransportError, WearEvent,
};
use crate::discovery::NodeDirectory;
use crate::file_transfer::types::TransferSession;
use crate::infrastructure::events::ConsumerRegistry;
use crate::protocol::TransferPath;
use crate::utils::{self, base_file_name};

/// Sending side of a stream-mode transfer.
///
/// Shut the writer down to complete the transfer; dropping it without a
/// shutdown makes the receiver report a failure.
pub struct OutgoingStream {
    pub request_id: CorrelationId,
    pub channel: Channel,
    pub writer: ChannelWriter,
}

/// Moves files and raw streams over transport channels.
///
/// Receiving sessions are keyed by channel token. A file session finishes once
/// its copy task has stopped and the channel input has closed, whichever comes
/// last; every session publishes exactly one [`WearEvent::TransferFinished`].
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    directory: Arc<NodeDirectory>,
    /// Directory where received files are stored
    download_dir: PathBuf,
    copy_buffer_bytes: usize,
    sessions: Mutex<HashMap<String, TransferSession>>,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConsumerRegistry>,
        directory: Arc<NodeDirectory>,
        download_dir: PathBuf,
        copy_buffer_bytes: usize,
    ) -> Self {
        Self {
            transport,
            registry,
            directory,
            download_dir,
            copy_buffer_bytes: copy_buffer_bytes.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, TransferSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Correlation ids of the sessions still in flight
    pub fn active_transfers(&self) -> Vec<CorrelationId> {
        self.sessions().values().map(|s| s.request_id.clone()).collect()
    }

    /// Drop every receiving session without reporting it, e.g. on disconnect
    pub fn clear(&self) -> usize {
        let drained: Vec<TransferSession> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in &drained {
            if let Some(task) = &session.copy_task {
                task.abort();
            }
        }
        if !drained.is_empty() {
            info!("Cleared {} active transfers", drained.len());
        }
        drained.len()
    }

    fn require_nearby(&self, node_id: &NodeId) -> Result<(), TransferError> {
        match self.directory.node_by_id(node_id) {
            Some(node) if node.is_nearby => Ok(()),
            _ => {
                warn!(%node_id, "Transfer target is not a nearby node");
                Err(TransportError::InvalidTargetNode(node_id.clone()).into())
            }
        }
    }

    async fn close_quietly(&self, channel: &Channel) {
        if let Err(e) = self.transport.close_channel(channel).await {
            debug!(token = %channel.token, "Failed to close channel: {}", e);
        }
    }

    // Sender side

    /// Open an application channel to a nearby node
    pub async fn open_channel(&self, node_id: &NodeId, path: &str) -> Result<Channel, TransferError> {
        self.require_nearby(node_id)?;
        if TransferPath::is_transfer_path(path) {
            warn!(%path, "Opening a plain channel on a reserved transfer path");
        }
        Ok(self.transport.open_channel(node_id, path).await?)
    }

    pub async fn close_channel(&self, channel: &Channel) -> Result<(), TransportError> {
        self.transport.close_channel(channel).await
    }

    /// Send the file at `local_path` to a nearby node.
    ///
    /// `name` overrides the name announced to the receiver. The outcome is
    /// returned and published as [`WearEvent::SendFileResult`].
    pub async fn send_file(
        &self,
        node_id: &NodeId,
        local_path: &Path,
        name: Option<&str>,
        request_id: Option<CorrelationId>,
    ) -> Result<CorrelationId, TransferError> {
        self.send_file_range(node_id, local_path, name, request_id, 0, None).await
    }

    /// Send `length` bytes of the file starting at `offset`; `None` sends
    /// through to the end. The receiver is told the size of the range.
    pub async fn send_file_range(
        &self,
        node_id: &NodeId,
        local_path: &Path,
        name: Option<&str>,
        request_id: Option<CorrelationId>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<CorrelationId, TransferError> {
        let request_id = request_id.unwrap_or_default();
        let result = self
            .try_send_file(node_id, local_path, name, &request_id, offset, length)
            .await;

        let status = match &result {
            Ok(bytes) => {
                info!(%request_id, %node_id, "Sent {} ({})", local_path.display(), utils::format_size(*bytes));
                StatusCode::Success
            }
            Err(e) => {
                error!(%request_id, %node_id, "Failed to send {}: {}", local_path.display(), e);
                e.status()
            }
        };
        self.registry.publish(WearEvent::SendFileResult {
            status,
            request_id: request_id.clone(),
        });
        result.map(|_| request_id)
    }

    async fn try_send_file(
        &self,
        node_id: &NodeId,
        local_path: &Path,
        name: Option<&str>,
        request_id: &CorrelationId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<u64, TransferError> {
        self.require_nearby(node_id)?;

        let name = match name {
            Some(name) => name.to_string(),
            None => local_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(String::from)
                .ok_or_else(|| TransferError::NoFileName(local_path.to_path_buf()))?,
        };
        let mut file = File::open(local_path).await?;
        let file_size = file.metadata().await?.len();
        if offset > file_size {
            return Err(TransferError::InvalidRange {
                offset,
                size: file_size,
            });
        }
        let available = file_size - offset;
        let size = length.map_or(available, |length| length.min(available));
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let path = TransferPath::file(name, size, request_id.clone()).encode()?;

        let channel = self.transport.open_channel(node_id, &path).await?;
        let mut writer = match self.transport.output_stream(&channel).await {
            Ok(writer) => writer,
            Err(e) => {
                self.close_quietly(&channel).await;
                return Err(e.into());
            }
        };

        let mut reader = BufReader::with_capacity(self.copy_buffer_bytes, file.take(size));
        match tokio::io::copy_buf(&mut reader, &mut writer).await {
            Ok(copied) => {
                writer.shutdown().await?;
                Ok(copied)
            }
            Err(e) => {
                // Dropping the writer unflushed tells the receiver the transfer broke
                drop(writer);
                self.close_quietly(&channel).await;
                Err(e.into())
            }
        }
    }

    /// Open a raw stream to a nearby node
    pub async fn open_output_stream(
        &self,
        node_id: &NodeId,
        request_id: Option<CorrelationId>,
    ) -> Result<OutgoingStream, TransferError> {
        self.require_nearby(node_id)?;
        let request_id = request_id.unwrap_or_default();
        let path = TransferPath::stream(request_id.clone()).encode()?;

        let channel = self.transport.open_channel(node_id, &path).await?;
        match self.transport.output_stream(&channel).await {
            Ok(writer) => {
                debug!(%request_id, %node_id, "Output stream opened");
                Ok(OutgoingStream {
                    request_id,
                    channel,
                    writer,
                })
            }
            Err(e) => {
                self.close_quietly(&channel).await;
                Err(e.into())
            }
        }
    }

    // Receiver side

    /// Route a channel opened by a peer: transfer paths start a session, any
    /// other path is handed to consumers.
    pub async fn handle_channel_opened(self: &Arc<Self>, channel: Channel) {
        if !TransferPath::is_transfer_path(&channel.path) {
            self.registry.publish(WearEvent::ChannelOpened { channel });
            return;
        }

        let request = match TransferPath::decode(&channel.path) {
            Ok(request) => request,
            Err(e) => {
                warn!(path = %channel.path, "Dropping malformed transfer request: {}", e);
                self.close_quietly(&channel).await;
                return;
            }
        };

        match request {
            TransferPath::File {
                name,
                size,
                request_id,
            } => self.accept_file(channel, name, size, request_id).await,
            TransferPath::Stream { request_id } => self.accept_stream(channel, request_id).await,
        }
    }

    fn insert_session(&self, session: TransferSession) -> Result<(), TransferError> {
        let mut sessions = self.sessions();
        if sessions.values().any(|s| s.request_id == session.request_id) {
            return Err(TransferError::DuplicateCorrelationId(session.request_id.to_string()));
        }
        sessions.insert(session.channel.token.clone(), session);
        Ok(())
    }

    async fn accept_file(self: &Arc<Self>, channel: Channel, name: String, size: u64, request_id: CorrelationId) {
        let Some(base_name) = base_file_name(&name) else {
            warn!(%request_id, "Dropping transfer with unusable file name {:?}", name);
            self.close_quietly(&channel).await;
            return;
        };
        let target = self.download_dir.join(&base_name);
        let session = TransferSession::file(request_id.clone(), channel.clone(), base_name, size, target.clone());
        if let Err(e) = self.insert_session(session) {
            warn!(%request_id, "Dropping transfer request: {}", e);
            self.close_quietly(&channel).await;
            return;
        }
        info!(%request_id, "Receiving {} ({})", target.display(), utils::format_size(size));

        let sink = match self.create_sink(&target).await {
            Ok(sink) => sink,
            Err(e) => {
                error!(%request_id, "Failed to create {}: {}", target.display(), e);
                self.fail(&channel.token).await;
                return;
            }
        };
        let input = match self.transport.input_stream(&channel).await {
            Ok(input) => input,
            Err(e) => {
                error!(%request_id, "Failed to obtain channel input: {}", e);
                self.fail(&channel.token).await;
                return;
            }
        };

        let engine = Arc::clone(self);
        let token = channel.token.clone();
        let buffer_size = self.copy_buffer_bytes;
        let task = tokio::spawn(async move {
            let (received, sink_error) = copy_to_sink(input, sink, buffer_size).await;
            engine.copy_finished(&token, received, sink_error).await;
        });

        if let Some(session) = self.sessions().get_mut(&channel.token) {
            session.status = TransferStatus::Streaming;
            session.copy_task = Some(task.abort_handle());
        }
    }

    async fn create_sink(&self, target: &Path) -> io::Result<File> {
        fs::create_dir_all(&self.download_dir).await?;
        File::create(target).await
    }

    async fn accept_stream(self: &Arc<Self>, channel: Channel, request_id: CorrelationId) {
        if let Err(e) = self.insert_session(TransferSession::stream(request_id.clone(), channel.clone())) {
            warn!(%request_id, "Dropping stream request: {}", e);
            self.close_quietly(&channel).await;
            return;
        }

        match self.transport.input_stream(&channel).await {
            Ok(reader) => {
                if let Some(session) = self.sessions().get_mut(&channel.token) {
                    session.status = TransferStatus::Streaming;
                }
                debug!(%request_id, "Input stream opened");
                self.registry.publish(WearEvent::InputStreamOpened {
                    status: StatusCode::Success,
                    request_id,
                    channel,
                    stream: InputStreamHandle::new(Some(reader)),
                });
            }
            Err(e) => {
                error!(%request_id, "Failed to obtain channel input: {}", e);
                self.registry.publish(WearEvent::InputStreamOpened {
                    status: e.status(),
                    request_id,
                    channel: channel.clone(),
                    stream: InputStreamHandle::new(None::<ChannelReader>),
                });
                self.fail(&channel.token).await;
            }
        }
    }

    async fn copy_finished(&self, token: &str, received: u64, sink_error: Option<io::Error>) {
        let finished = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(token) else {
                return;
            };
            session.copy_finished = true;
            session.received_bytes = received;
            session.copy_task = None;

            if let Some(e) = &sink_error {
                error!(request_id = %session.request_id, "Failed writing received bytes: {}", e);
                sessions.remove(token).map(|s| (s, TransferStatus::Failed))
            } else if session.ready_to_finish() {
                sessions.remove(token).map(|s| {
                    let status = s.final_status();
                    (s, status)
                })
            } else {
                None
            }
        };

        if let Some((session, status)) = finished {
            self.finish(session, status).await;
        }
    }

    /// Record why a session's input closed and finish it if its copy is done
    async fn record_close(&self, channel: &Channel, reason: CloseReason) {
        let finished = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(&channel.token) else {
                return;
            };
            if session.close_reason.is_none() {
                session.close_reason = Some(reason);
            }
            if session.ready_to_finish() {
                sessions.remove(&channel.token).map(|s| {
                    let status = s.final_status();
                    (s, status)
                })
            } else {
                None
            }
        };

        if let Some((session, status)) = finished {
            self.finish(session, status).await;
        }
    }

    async fn fail(&self, token: &str) {
        let session = self.sessions().remove(token);
        if let Some(session) = session {
            self.finish(session, TransferStatus::Failed).await;
        }
    }

    async fn finish(&self, session: TransferSession, status: TransferStatus) {
        let outcome = session.outcome(status);
        match status {
            TransferStatus::Completed => info!(
                request_id = %outcome.request_id,
                "Transfer completed ({} bytes)",
                outcome.received_bytes
            ),
            _ => warn!(
                request_id = %outcome.request_id,
                reason = ?session.close_reason,
                "Transfer failed: {} of {:?} bytes received",
                outcome.received_bytes,
                outcome.declared_bytes
            ),
        }
        self.registry.publish(WearEvent::TransferFinished(outcome));
        self.close_quietly(&session.channel).await;
    }

    pub async fn handle_input_closed(&self, channel: &Channel, reason: CloseReason) {
        self.record_close(channel, reason).await;
    }

    /// A channel closed entirely; for a session still waiting on its input this is the close
    pub async fn handle_channel_closed(&self, channel: &Channel, reason: CloseReason) {
        self.record_close(channel, reason).await;
    }

    /// Our side of a channel finished writing; the channel is released
    pub async fn handle_output_closed(&self, channel: &Channel, reason: CloseReason) {
        debug!(token = %channel.token, ?reason, "Output closed, closing channel");
        self.close_quietly(channel).await;
    }
}

/// Copy channel input into `sink`. Returns the bytes written and the sink
/// error that stopped the copy, if any; a failing read just ends the copy.
async fn copy_to_sink(mut input: ChannelReader, mut sink: File, buffer_size: usize) -> (u64, Option<io::Error>) {
    let mut buffer = vec![0u8; buffer_size];
    let mut received = 0u64;
    loop {
        let n = match input.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Channel read ended early: {}", e);
                break;
            }
        };
        if let Err(e) = sink.write_all(&buffer[..n]).await {
            return (received, Some(e));
        }
        received += n as u64;
    }
    match sink.flush().await {
        Ok(()) => (received, None),
        Err(e) => (received, Some(e)),
    }
}
