//! Client facade: registration, subscriptions, downloads.
//!
//! One `Client` owns one slot tracker, shared by every subscription's CTS
//! gate and every download.

use std::sync::Arc;

use sluice_flow::{delivery_queue, FlowStats, Resource, SlotTracker, SubscriptionMachine};
use sluice_protocol::{DataRequest, Token};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::download::{Download, DownloadError, Downloader};
use crate::reconnect::Reconnector;
use crate::registration::RegistrationClient;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::stream::ResourceStream;
use crate::subscription_task::SubscriptionTask;
use crate::transport::Connector;
use crate::ws_transport::WsConnector;
use crate::ClientError;

pub struct Client<C: Connector = WsConnector> {
    config: ClientConfig,
    connector: Arc<C>,
    slots: SlotTracker,
    registry: SubscriptionRegistry,
    registration: RegistrationClient,
    downloader: Downloader,
}

impl Client<WsConnector> {
    /// Client for the configured WebSocket service.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let connector = WsConnector::new(
            config.services.filtered_resource_url.clone(),
            config.connect_timeout(),
        );
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> Client<C> {
    pub fn with_connector(config: ClientConfig, connector: C) -> Result<Self, ClientError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        let slots = SlotTracker::new(config.download.capacity);
        let registration =
            RegistrationClient::new(http.clone(), config.services.registration_url.clone());
        let downloader = Downloader::new(http, slots.clone(), config.slot_poll());

        tracing::debug!(
            capacity = slots.capacity(),
            registration = %config.services.registration_url,
            filtered_resource = %config.services.filtered_resource_url,
            "client ready"
        );

        Ok(Self {
            config,
            connector: Arc::new(connector),
            slots,
            registry: SubscriptionRegistry::new(),
            registration,
            downloader,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotTracker {
        &self.slots
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Register a data request and return its token.
    pub async fn register(&self, request: &DataRequest) -> Result<Token, ClientError> {
        Ok(self.registration.register(request).await?)
    }

    /// Start streaming resources for `token`. The driver runs on its own
    /// task until the stream completes, fails, or is cancelled.
    pub async fn subscribe(&self, token: impl Into<Token>) -> Result<ResourceStream, ClientError> {
        let token = token.into();
        let stats = Arc::new(FlowStats::new());
        let cancel = CancellationToken::new();

        self.registry
            .insert(SubscriptionHandle::new(token.clone(), cancel.clone(), stats.clone()))
            .await?;

        let (sender, receiver) = delivery_queue(self.config.stream.queue_capacity);
        let machine = SubscriptionMachine::with_stats(
            token.clone(),
            self.config.reconnect.resume_policy,
            stats.clone(),
        );
        let task = SubscriptionTask::new(
            machine,
            Reconnector::new(self.connector.clone(), self.config.reconnect_policy()),
            self.slots.clone(),
            sender,
            cancel.clone(),
            self.config.slot_poll(),
        );

        let registry = self.registry.clone();
        let task_token = token.clone();
        let driver = tokio::spawn(async move {
            let terminal = task.run().await;
            registry.remove(&task_token).await;
            terminal
        });

        Ok(ResourceStream::new(token, receiver, cancel, stats, Some(driver)))
    }

    /// Fetch a delivered resource, waiting for a free slot first.
    pub async fn download(&self, resource: &Resource) -> Result<Download, DownloadError> {
        self.downloader.download(resource).await
    }

    pub async fn cancel(&self, token: &str) -> bool {
        self.registry.cancel(token).await
    }

    pub async fn cancel_all(&self) -> usize {
        self.registry.cancel_all().await
    }

    pub async fn active_tokens(&self) -> Vec<Token> {
        self.registry.active_tokens().await
    }

    /// Cancel everything and wait (bounded) for the drivers to unregister.
    pub async fn shutdown(&self) {
        let count = self.registry.cancel_all().await;
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout();
        while !self.registry.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.slot_poll()).await;
        }
        let left = self.registry.len().await;
        if left > 0 {
            tracing::warn!(cancelled = count, left, "shutdown: drivers still running");
        } else {
            tracing::info!(cancelled = count, "shutdown complete");
        }
    }
}

impl<C: Connector> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("slots", &self.slots)
            .field("services", &self.config.services)
            .finish()
    }
}
