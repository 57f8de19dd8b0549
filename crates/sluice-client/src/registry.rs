//! Subscription registry -- thread-safe map of active tokens.
//!
//! Maps Token -> SubscriptionHandle (cancel flag + counters, no I/O).
//! Each driver task owns its own connection; this registry only lets
//! callers find, inspect, and cancel them. At most one active
//! subscription per token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sluice_flow::{FlowStats, Phase, StatsSnapshot};
use sluice_protocol::Token;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Handle to a running subscription (metadata only).
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub token: Token,
    pub cancel: CancellationToken,
    pub stats: Arc<FlowStats>,
    pub started_at: Instant,
}

impl SubscriptionHandle {
    pub fn new(token: impl Into<Token>, cancel: CancellationToken, stats: Arc<FlowStats>) -> Self {
        Self {
            token: token.into(),
            cancel,
            stats,
            started_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.stats.phase()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("subscription {0} is already active")]
pub struct AlreadyActive(pub Token);

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<HashMap<Token, SubscriptionHandle>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription. Fails if the token is already active.
    pub async fn insert(&self, handle: SubscriptionHandle) -> Result<(), AlreadyActive> {
        let mut map = self.inner.write().await;
        if map.contains_key(&handle.token) {
            return Err(AlreadyActive(handle.token));
        }
        let token = handle.token.clone();
        map.insert(token.clone(), handle);
        tracing::info!(%token, active = map.len(), "registry: subscription added");
        Ok(())
    }

    /// Remove a finished subscription.
    pub async fn remove(&self, token: &str) -> Option<SubscriptionHandle> {
        let mut map = self.inner.write().await;
        let removed = map.remove(token);
        if removed.is_some() {
            tracing::info!(%token, active = map.len(), "registry: subscription removed");
        }
        removed
    }

    pub async fn get(&self, token: &str) -> Option<SubscriptionHandle> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.inner.read().await.contains_key(token)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Tokens of all active subscriptions, sorted.
    pub async fn active_tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.inner.read().await.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Signal cancellation. The driver removes the entry when it exits.
    pub async fn cancel(&self, token: &str) -> bool {
        match self.inner.read().await.get(token) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let map = self.inner.read().await;
        for handle in map.values() {
            handle.cancel.cancel();
        }
        if !map.is_empty() {
            tracing::info!(count = map.len(), "registry: cancelling all subscriptions");
        }
        map.len()
    }

    /// Counters for every active subscription, sorted by token.
    pub async fn snapshot(&self) -> Vec<(Token, StatsSnapshot)> {
        let mut out: Vec<(Token, StatsSnapshot)> = self
            .inner
            .read()
            .await
            .values()
            .map(|h| (h.token.clone(), h.stats.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
