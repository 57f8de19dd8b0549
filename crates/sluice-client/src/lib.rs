//! Sluice Client -- async SDK for the filtered-resource broker.
//!
//! Register a data request, stream the resulting resources under RTS/CTS
//! flow control, and download each one through a bounded pool of slots.

pub mod client;
pub mod config;
pub mod download;
pub mod fetch;
pub mod reconnect;
pub mod registration;
pub mod registry;
pub mod stream;
pub mod subscription_task;
pub mod transport;
pub mod ws_transport;

pub use client::Client;
pub use config::ClientConfig;
pub use download::{Download, DownloadError, Downloader};
pub use fetch::{fetch_to_dir, FetchError, FetchPool, Fetched};
pub use reconnect::{ReconnectError, Reconnector};
pub use registration::{RegistrationClient, RegistrationError};
pub use registry::{AlreadyActive, SubscriptionHandle, SubscriptionRegistry};
pub use stream::ResourceStream;
pub use transport::{Connector, FramedTransport, Transport, TransportError};
pub use ws_transport::{WsConnector, WsTransport};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    AlreadyActive(#[from] AlreadyActive),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
