use std::path::PathBuf;
use thiserror::Error;

use super::domain::{NodeId, StatusCode};

/// Failures reported by the transport plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport service unavailable")]
    Unavailable,

    #[error("target node {0} is not connected")]
    TargetNodeNotConnected(NodeId),

    #[error("node {0} is not nearby")]
    InvalidTargetNode(NodeId),

    #[error("capability {0} is already registered")]
    DuplicateCapability(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("asset {0} is unavailable")]
    AssetUnavailable(String),

    #[error("channel {0} is unknown or closed")]
    ChannelClosed(String),

    #[error("stream of channel {0} was already taken")]
    StreamTaken(String),

    #[error("operation timed out")]
    Timeout,

    #[error("blocking call made from an async runtime thread")]
    WrongThread,

    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::NotConnected | TransportError::Unavailable => StatusCode::ApiNotConnected,
            TransportError::TargetNodeNotConnected(_) => StatusCode::TargetNodeNotConnected,
            TransportError::InvalidTargetNode(_) => StatusCode::InvalidTargetNode,
            TransportError::DuplicateCapability(_) => StatusCode::DuplicateCapability,
            TransportError::UnknownCapability(_) => StatusCode::UnknownCapability,
            TransportError::AssetUnavailable(_) => StatusCode::AssetUnavailable,
            TransportError::Timeout => StatusCode::Timeout,
            TransportError::WrongThread => StatusCode::DeveloperError,
            TransportError::ChannelClosed(_)
            | TransportError::StreamTaken(_)
            | TransportError::Failed(_) => StatusCode::Error,
        }
    }
}

/// Malformed transfer metadata in a channel path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("path does not start with a transfer prefix: {0}")]
    UnknownPrefix(String),

    #[error("expected {expected} path segments after the prefix, found {found}")]
    SegmentCount { expected: usize, found: usize },

    #[error("invalid percent escape at byte {0}")]
    InvalidEscape(usize),

    #[error("decoded file name is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid byte length: {0:?}")]
    InvalidLength(String),

    #[error("empty {0}")]
    Empty(&'static str),

    #[error("correlation id may not contain '/': {0:?}")]
    InvalidCorrelationId(String),
}

/// Sender-side transfer failures
#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("correlation id {0} already has an active transfer")]
    DuplicateCorrelationId(String),

    #[error("offset {offset} is past the end of a {size}-byte file")]
    InvalidRange { offset: u64, size: u64 },
}

impl TransferError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransferError::Transport(e) => e.status(),
            TransferError::Protocol(_) | TransferError::NoFileName(_) | TransferError::InvalidRange { .. } => {
                StatusCode::DeveloperError
            }
            TransferError::Io(_) | TransferError::DuplicateCorrelationId(_) => StatusCode::Error,
        }
    }
}
