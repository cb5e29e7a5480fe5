use std::path::PathBuf;
use tokio::task::AbortHandle;

use crate::core::{Channel, CloseReason, CorrelationId, TransferMode, TransferOutcome, TransferStatus};

/// Decide the terminal status of a session once its input has closed.
///
/// A file transfer completes only on a normal close with exactly the declared
/// number of bytes on disk; a stream completes on any normal close.
pub fn classify(mode: TransferMode, reason: CloseReason, declared: Option<u64>, received: u64) -> TransferStatus {
    let completed = match mode {
        TransferMode::File => reason.is_normal() && declared == Some(received),
        TransferMode::Stream => reason.is_normal(),
    };
    if completed {
        TransferStatus::Completed
    } else {
        TransferStatus::Failed
    }
}

/// Receiving-side state of one transfer
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub request_id: CorrelationId,
    pub channel: Channel,
    pub mode: TransferMode,
    pub status: TransferStatus,
    pub declared_bytes: Option<u64>,
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub received_bytes: u64,
    pub close_reason: Option<CloseReason>,
    /// Set once the copy task stopped reading, cleanly or not
    pub copy_finished: bool,
    pub copy_task: Option<AbortHandle>,
}

impl TransferSession {
    pub fn file(request_id: CorrelationId, channel: Channel, name: String, declared: u64, file: PathBuf) -> Self {
        Self {
            request_id,
            channel,
            mode: TransferMode::File,
            status: TransferStatus::Opening,
            declared_bytes: Some(declared),
            name: Some(name),
            file: Some(file),
            received_bytes: 0,
            close_reason: None,
            copy_finished: false,
            copy_task: None,
        }
    }

    pub fn stream(request_id: CorrelationId, channel: Channel) -> Self {
        Self {
            request_id,
            channel,
            mode: TransferMode::Stream,
            status: TransferStatus::Opening,
            declared_bytes: None,
            name: None,
            file: None,
            received_bytes: 0,
            close_reason: None,
            copy_finished: false,
            copy_task: None,
        }
    }

    /// Both signals a file session waits for have arrived; streams only wait for the close
    pub fn ready_to_finish(&self) -> bool {
        match self.mode {
            TransferMode::File => self.copy_finished && self.close_reason.is_some(),
            TransferMode::Stream => self.close_reason.is_some(),
        }
    }

    /// Terminal status given what has been observed so far
    pub fn final_status(&self) -> TransferStatus {
        match self.close_reason {
            Some(reason) => classify(self.mode, reason, self.declared_bytes, self.received_bytes),
            None => TransferStatus::Failed,
        }
    }

    pub fn outcome(&self, status: TransferStatus) -> TransferOutcome {
        TransferOutcome {
            mode: self.mode,
            status,
            request_id: self.request_id.clone(),
            file: self.file.clone(),
            name: self.name.clone(),
            declared_bytes: self.declared_bytes,
            received_bytes: self.received_bytes,
        }
    }
}
