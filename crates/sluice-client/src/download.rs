//! Resource downloads through the shared slot tracker.
//!
//! A download takes a slot before the request goes out and holds it until
//! the body is fully read or the `Download` is dropped. The subscription
//! driver withholds CTS while no slot is free, so the number of in-flight
//! downloads is what throttles the stream.

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use sluice_flow::{Permit, Resource, ResourceItem, SlotTracker};
use sluice_protocol::{ReadRequest, READ_CHUNKED_PATH};
use tokio::io::AsyncWriteExt;

use crate::subscription_task::slot_freed;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("resource {leaf_resource_id} not found")]
    NotFound { leaf_resource_id: String },

    #[error("transfer failed: HTTP {status}: {body}")]
    Transfer { status: u16, body: String },

    #[error("item {seq} is an error, not a resource")]
    NotAResource { seq: u64 },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct Downloader {
    http: reqwest::Client,
    slots: SlotTracker,
    slot_poll: Duration,
}

impl Downloader {
    pub fn new(http: reqwest::Client, slots: SlotTracker, slot_poll: Duration) -> Self {
        Self {
            http,
            slots,
            slot_poll,
        }
    }

    pub fn slots(&self) -> &SlotTracker {
        &self.slots
    }

    /// Wait for a slot, then request the resource's bytes from
    /// `{resource.url}/read/chunked`.
    pub async fn download(&self, resource: &Resource) -> Result<Download, DownloadError> {
        let permit = self.acquire().await;
        let url = format!("{}{}", resource.url.trim_end_matches('/'), READ_CHUNKED_PATH);
        let body = ReadRequest {
            token: resource.token.clone(),
            leaf_resource_id: resource.leaf_resource_id.clone(),
        };

        tracing::debug!(
            %url,
            leaf = %resource.leaf_resource_id,
            seq = resource.seq,
            in_use = self.slots.in_use(),
            "download: requesting"
        );
        let resp = self.http.post(&url).json(&body).send().await?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(DownloadError::NotFound {
                    leaf_resource_id: resource.leaf_resource_id.clone(),
                });
            }
            s => {
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%url, status = s.as_u16(), "download: transfer failed");
                return Err(DownloadError::Transfer {
                    status: s.as_u16(),
                    body: text,
                });
            }
        }

        Ok(Download {
            leaf_resource_id: resource.leaf_resource_id.clone(),
            body: Box::pin(resp.bytes_stream()),
            permit: Some(permit),
            bytes_read: 0,
        })
    }

    /// `download` for a delivered item; error items have nothing to fetch.
    pub async fn download_item(&self, item: &ResourceItem) -> Result<Download, DownloadError> {
        match item.as_resource() {
            Some(resource) => self.download(resource).await,
            None => Err(DownloadError::NotAResource { seq: item.seq() }),
        }
    }

    async fn acquire(&self) -> Permit {
        loop {
            if let Some(permit) = self.slots.try_acquire() {
                return permit;
            }
            slot_freed(&self.slots, self.slot_poll).await;
        }
    }
}

/// An in-flight resource body. Holds its download slot until the body
/// ends or this value is dropped.
pub struct Download {
    leaf_resource_id: String,
    body: ByteStream,
    permit: Option<Permit>,
    bytes_read: u64,
}

impl Download {
    pub fn leaf_resource_id(&self) -> &str {
        &self.leaf_resource_id
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether this download still occupies a slot.
    pub fn holds_slot(&self) -> bool {
        self.permit.is_some()
    }

    /// Next chunk of the body. Releases the slot at end of body or on error.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, DownloadError>> {
        self.permit.as_ref()?;
        match self.body.next().await {
            Some(Ok(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                self.finish();
                Some(Err(e.into()))
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// Read the whole body into memory.
    pub async fn bytes(mut self) -> Result<Bytes, DownloadError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Stream the body into a file, creating or truncating it. Returns the
    /// number of bytes written.
    pub async fn write_to(mut self, path: &Path) -> Result<u64, DownloadError> {
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = self.chunk().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(self.bytes_read)
    }

    fn finish(&mut self) {
        if self.permit.take().is_some() {
            tracing::debug!(
                leaf = %self.leaf_resource_id,
                bytes = self.bytes_read,
                "download: slot released"
            );
        }
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("leaf_resource_id", &self.leaf_resource_id)
            .field("bytes_read", &self.bytes_read)
            .field("holds_slot", &self.permit.is_some())
            .finish()
    }
}
