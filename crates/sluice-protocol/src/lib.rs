//! Sluice Protocol -- wire types and codecs for the filtered-resource stream.
//!
//! One duplex connection per subscription token. Every frame is a JSON
//! object with a `type` discriminator and the owning `token`.
//! WebSocket text frames carry one JSON object each; byte-stream transports
//! use a 4-byte big-endian length prefix + the same JSON payload.

pub mod codec;
pub mod messages;

pub use codec::{decode_text, encode_text, MessageCodec};
pub use messages::*;

/// Maximum size of a single protocol frame: 1 MB.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Path prefix of the filtered-resource stream endpoint: `{base}/resource/{token}`.
pub const RESOURCE_STREAM_PATH: &str = "/resource";

/// Registration endpoint, relative to the registration service base URL.
pub const REGISTER_PATH: &str = "/api/registerDataRequest";

/// Chunked read endpoint, relative to a resource's data service URL.
pub const READ_CHUNKED_PATH: &str = "/read/chunked";

/// Opaque subscription token issued by the registration call.
pub type Token = String;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
