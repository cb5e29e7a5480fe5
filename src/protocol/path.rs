//! Channel-path encoding of transfer metadata.
//!
//! A transfer is announced purely by the path its channel is opened against:
//!
//! ```text
//! /wearlink/transfer/v1/file/{form-urlencoded name}/{byte length}/{correlation id}
//! /wearlink/transfer/v1/stream/{correlation id}
//! ```
//!
//! Names use `application/x-www-form-urlencoded` escaping: `A-Z a-z 0-9 * - . _`
//! pass through, space becomes `+`, every other UTF-8 byte becomes `%XX`.
//! The escaped form never contains `/`, so segments split unambiguously.

use crate::core::{CorrelationId, ProtocolError};

use super::{TRANSFER_PREFIX_FILE, TRANSFER_PREFIX_STREAM};

/// Metadata carried by a transfer channel path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPath {
    File {
        name: String,
        size: u64,
        request_id: CorrelationId,
    },
    Stream {
        request_id: CorrelationId,
    },
}

impl TransferPath {
    pub fn file(name: impl Into<String>, size: u64, request_id: CorrelationId) -> Self {
        TransferPath::File {
            name: name.into(),
            size,
            request_id,
        }
    }

    pub fn stream(request_id: CorrelationId) -> Self {
        TransferPath::Stream { request_id }
    }

    pub fn request_id(&self) -> &CorrelationId {
        match self {
            TransferPath::File { request_id, .. } | TransferPath::Stream { request_id } => request_id,
        }
    }

    /// Whether `path` claims to be a transfer request (it may still be malformed)
    pub fn is_transfer_path(path: &str) -> bool {
        path.starts_with(TRANSFER_PREFIX_FILE) || path.starts_with(TRANSFER_PREFIX_STREAM)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            TransferPath::File {
                name,
                size,
                request_id,
            } => {
                if name.is_empty() {
                    return Err(ProtocolError::Empty("file name"));
                }
                validate_request_id(request_id.as_str())?;
                Ok(format!(
                    "{}{}/{}/{}",
                    TRANSFER_PREFIX_FILE,
                    encode_component(name),
                    size,
                    request_id
                ))
            }
            TransferPath::Stream { request_id } => {
                validate_request_id(request_id.as_str())?;
                Ok(format!("{}{}", TRANSFER_PREFIX_STREAM, request_id))
            }
        }
    }

    pub fn decode(path: &str) -> Result<Self, ProtocolError> {
        if let Some(rest) = path.strip_prefix(TRANSFER_PREFIX_FILE) {
            let segments: Vec<&str> = rest.split('/').collect();
            if segments.len() != 3 {
                return Err(ProtocolError::SegmentCount {
                    expected: 3,
                    found: segments.len(),
                });
            }

            let name = decode_component(segments[0])?;
            if name.is_empty() {
                return Err(ProtocolError::Empty("file name"));
            }
            let size = parse_length(segments[1])?;
            validate_request_id(segments[2])?;

            Ok(TransferPath::File {
                name,
                size,
                request_id: CorrelationId::from_string(segments[2].to_string()),
            })
        } else if let Some(rest) = path.strip_prefix(TRANSFER_PREFIX_STREAM) {
            if rest.contains('/') {
                return Err(ProtocolError::SegmentCount {
                    expected: 1,
                    found: rest.split('/').count(),
                });
            }
            validate_request_id(rest)?;
            Ok(TransferPath::Stream {
                request_id: CorrelationId::from_string(rest.to_string()),
            })
        } else {
            Err(ProtocolError::UnknownPrefix(path.to_string()))
        }
    }
}

fn validate_request_id(id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() {
        return Err(ProtocolError::Empty("correlation id"));
    }
    if id.contains('/') {
        return Err(ProtocolError::InvalidCorrelationId(id.to_string()));
    }
    Ok(())
}

fn parse_length(segment: &str) -> Result<u64, ProtocolError> {
    // u64::from_str tolerates a leading '+', the wire format does not
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidLength(segment.to_string()));
    }
    segment
        .parse()
        .map_err(|_| ProtocolError::InvalidLength(segment.to_string()))
}

/// Form-urlencode one path component
pub fn encode_component(value: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'*' | b'-' | b'.' | b'_' => out.push(byte as char),
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0x0f) as usize] as char);
            }
        }
    }
    out
}

/// Reverse of [`encode_component`]; also accepts lowercase hex
pub fn decode_component(value: &str) -> Result<String, ProtocolError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
                let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                    _ => return Err(ProtocolError::InvalidEscape(i)),
                }
                i += 3;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ProtocolError::InvalidUtf8)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
