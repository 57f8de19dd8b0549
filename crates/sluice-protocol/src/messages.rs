//! Wire message types for the filtered-resource protocol.
//!
//! A single closed enum covers both directions. Client-bound and
//! server-bound variants share the enum so the state machine can match
//! exhaustively and reject frames sent in the wrong direction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Token;

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    /// client -> server: open (or resume) the subscription for `token`.
    Subscribe { token: Token },
    /// server -> client: subscription accepted. `resumed` is true when the
    /// server re-attached an existing cursor.
    Subscribed {
        token: Token,
        #[serde(default)]
        resumed: bool,
    },
    /// server -> client: one resource is ready.
    #[serde(rename = "RTS")]
    ReadyToSend { token: Token },
    /// client -> server: send the ready resource.
    #[serde(rename = "CTS")]
    ClearToSend { token: Token },
    /// server -> client: one resource description.
    Resource { token: Token, body: ResourceBody },
    /// server -> client: a per-resource error, in place of a resource.
    Error { token: Token, body: String },
    /// server -> client: no more resources.
    Complete { token: Token },
    /// server -> client keepalive.
    Ping { token: Token },
    /// client -> server keepalive reply.
    Pong { token: Token },
}

/// Wire discriminator, for logging and violation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Subscribe,
    Subscribed,
    ReadyToSend,
    ClearToSend,
    Resource,
    Error,
    Complete,
    Ping,
    Pong,
}

impl MessageKind {
    /// The `type` value as it appears on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            MessageKind::Subscribe => "SUBSCRIBE",
            MessageKind::Subscribed => "SUBSCRIBED",
            MessageKind::ReadyToSend => "RTS",
            MessageKind::ClearToSend => "CTS",
            MessageKind::Resource => "RESOURCE",
            MessageKind::Error => "ERROR",
            MessageKind::Complete => "COMPLETE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
        }
    }

    /// Whether a well-behaved server may send this kind.
    pub fn is_server_bound(&self) -> bool {
        matches!(
            self,
            MessageKind::Subscribe | MessageKind::ClearToSend | MessageKind::Pong
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl ProtocolMessage {
    pub fn subscribe(token: impl Into<Token>) -> Self {
        ProtocolMessage::Subscribe {
            token: token.into(),
        }
    }

    pub fn clear_to_send(token: impl Into<Token>) -> Self {
        ProtocolMessage::ClearToSend {
            token: token.into(),
        }
    }

    pub fn pong(token: impl Into<Token>) -> Self {
        ProtocolMessage::Pong {
            token: token.into(),
        }
    }

    /// Token of the subscription this frame belongs to.
    pub fn token(&self) -> &str {
        match self {
            ProtocolMessage::Subscribe { token }
            | ProtocolMessage::Subscribed { token, .. }
            | ProtocolMessage::ReadyToSend { token }
            | ProtocolMessage::ClearToSend { token }
            | ProtocolMessage::Resource { token, .. }
            | ProtocolMessage::Error { token, .. }
            | ProtocolMessage::Complete { token }
            | ProtocolMessage::Ping { token }
            | ProtocolMessage::Pong { token } => token,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::Subscribe { .. } => MessageKind::Subscribe,
            ProtocolMessage::Subscribed { .. } => MessageKind::Subscribed,
            ProtocolMessage::ReadyToSend { .. } => MessageKind::ReadyToSend,
            ProtocolMessage::ClearToSend { .. } => MessageKind::ClearToSend,
            ProtocolMessage::Resource { .. } => MessageKind::Resource,
            ProtocolMessage::Error { .. } => MessageKind::Error,
            ProtocolMessage::Complete { .. } => MessageKind::Complete,
            ProtocolMessage::Ping { .. } => MessageKind::Ping,
            ProtocolMessage::Pong { .. } => MessageKind::Pong,
        }
    }
}

// ============================================================================
// Resource description
// ============================================================================

/// Body of a `RESOURCE` frame: enough to issue a download later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBody {
    pub leaf_resource_id: String,
    /// Base URL of the data service holding the bytes.
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub serialised_format: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

// ============================================================================
// Registration + download request bodies (HTTP, not framed)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub user_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestResponse {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub token: Token,
    pub leaf_resource_id: String,
}
