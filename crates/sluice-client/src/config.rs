//! Configuration types for the sluice client.
//! Parsed from ~/.sluice/config.toml.

use serde::{Deserialize, Serialize};
use sluice_flow::{ReconnectPolicy, ResumePolicy, DEFAULT_QUEUE_CAPACITY};
use std::path::Path;
use std::time::Duration;

use crate::ClientError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesSection {
    /// Base URL of the data-request registration service.
    #[serde(default = "default_registration_url")]
    pub registration_url: String,
    /// Base URL of the filtered-resource WebSocket service.
    #[serde(default = "default_filtered_resource_url")]
    pub filtered_resource_url: String,
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            registration_url: default_registration_url(),
            filtered_resource_url: default_filtered_resource_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSection {
    /// Concurrent downloads allowed; also gates CTS.
    #[serde(default = "default_1")]
    pub capacity: usize,
    /// Fallback poll interval while waiting for a free slot.
    #[serde(default = "default_250")]
    pub slot_poll_ms: u64,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            capacity: 1,
            slot_poll_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_10000")]
    pub connect_timeout_ms: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_5")]
    pub max_attempts: u32,
    #[serde(default = "default_200")]
    pub base_delay_ms: u64,
    #[serde(default = "default_10000")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub resume_policy: ResumePolicy,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            resume_policy: ResumePolicy::Fail,
        }
    }
}

// Default value functions
fn default_registration_url() -> String {
    "http://localhost:8084".into()
}
fn default_filtered_resource_url() -> String {
    "ws://localhost:8092".into()
}
fn default_1() -> usize {
    1
}
fn default_5() -> u32 {
    5
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_200() -> u64 {
    200
}
fn default_250() -> u64 {
    250
}
fn default_10000() -> u64 {
    10_000
}

impl ClientConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.download.capacity == 0 {
            return Err(ClientError::Config("download.capacity must be > 0".into()));
        }
        if self.stream.queue_capacity == 0 {
            return Err(ClientError::Config("stream.queue_capacity must be > 0".into()));
        }
        if self.download.slot_poll_ms == 0 {
            return Err(ClientError::Config("download.slot_poll_ms must be > 0".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ClientError::Config(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms".into(),
            ));
        }
        for (key, url) in [
            ("services.registration_url", &self.services.registration_url),
            ("services.filtered_resource_url", &self.services.filtered_resource_url),
        ] {
            if !url.contains("://") {
                return Err(ClientError::Config(format!("{key} is not a URL: {url}")));
            }
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    pub fn slot_poll(&self) -> Duration {
        Duration::from_millis(self.download.slot_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.connect_timeout_ms)
    }
}
