pub mod path;

pub use path::{TransferPath, decode_component, encode_component};

// Protocol constants and utilities
pub const PROTOCOL_VERSION: &str = "v1";

/// Reserved channel-path prefix of full-file transfers
pub const TRANSFER_PREFIX_FILE: &str = "/wearlink/transfer/v1/file/";

/// Reserved channel-path prefix of raw stream transfers
pub const TRANSFER_PREFIX_STREAM: &str = "/wearlink/transfer/v1/stream/";
