//! Items handed to the caller through the delivery queue.

use std::collections::BTreeMap;

use serde::Serialize;
use sluice_protocol::{ResourceBody, Token};

/// A described resource: enough to issue the download later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// 1-based arrival order within the subscription.
    pub seq: u64,
    pub token: Token,
    pub leaf_resource_id: String,
    /// Base URL of the data service holding the bytes.
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub serialised_format: String,
    pub attributes: BTreeMap<String, String>,
}

impl Resource {
    pub fn from_body(seq: u64, token: Token, body: ResourceBody) -> Self {
        Self {
            seq,
            token,
            leaf_resource_id: body.leaf_resource_id,
            url: body.url,
            resource_type: body.resource_type,
            serialised_format: body.serialised_format,
            attributes: body.attributes,
        }
    }
}

/// One unit delivered to the caller. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceItem {
    Resource(Resource),
    Error { seq: u64, token: Token, text: String },
}

impl ResourceItem {
    pub fn seq(&self) -> u64 {
        match self {
            ResourceItem::Resource(r) => r.seq,
            ResourceItem::Error { seq, .. } => *seq,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            ResourceItem::Resource(r) => &r.token,
            ResourceItem::Error { token, .. } => token,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResourceItem::Error { .. })
    }

    pub fn as_resource(&self) -> Option<&Resource> {
        match self {
            ResourceItem::Resource(r) => Some(r),
            ResourceItem::Error { .. } => None,
        }
    }
}

/// How a subscription ended. Always the last thing a consumer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "end", content = "reason", rename_all = "lowercase")]
pub enum Terminal {
    Complete,
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Terminal::Complete => f.write_str("complete"),
            Terminal::Cancelled => f.write_str("cancelled"),
            Terminal::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What a consumer pulls: an item, or the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Delivery {
    Item(ResourceItem),
    End(Terminal),
}

impl Delivery {
    pub fn is_end(&self) -> bool {
        matches!(self, Delivery::End(_))
    }
}
