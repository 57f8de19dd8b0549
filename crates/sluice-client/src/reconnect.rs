//! Reconnect with bounded, jittered exponential backoff.

use std::sync::Arc;

use sluice_flow::ReconnectPolicy;

use crate::transport::{Connector, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("gave up after {attempts} reconnect attempts, last error: {}", last_error.as_deref().unwrap_or("none"))]
    GiveUp {
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("reconnect attempt {attempt} failed: {source}")]
    Attempt {
        attempt: u32,
        #[source]
        source: TransportError,
    },
}

/// Wraps a shared connector with a retry budget. Owned by one driver.
pub struct Reconnector<C> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
    last_error: Option<String>,
}

impl<C: Connector> Reconnector<C> {
    pub fn new(connector: Arc<C>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            last_error: None,
        }
    }

    /// Forget the last failure once a connection is healthy again.
    pub fn reset(&mut self) {
        self.last_error = None;
    }

    /// Try connection number `attempt` (0 = initial connect, no delay).
    ///
    /// Sleeps the backoff delay first. Fails with `GiveUp` without sleeping
    /// once `attempt` is past the budget.
    pub async fn reconnect(
        &mut self,
        token: &str,
        attempt: u32,
    ) -> Result<C::Transport, ReconnectError> {
        if !self.policy.allows(attempt) {
            return Err(ReconnectError::GiveUp {
                attempts: self.policy.max_attempts,
                last_error: self.last_error.take(),
            });
        }

        let delay = self.policy.jittered_delay(attempt);
        if !delay.is_zero() {
            tracing::info!(
                token,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect: backing off"
            );
            tokio::time::sleep(delay).await;
        }

        match self.connector.connect(token).await {
            Ok(transport) => Ok(transport),
            Err(source) => {
                tracing::warn!(token, attempt, "reconnect: attempt failed: {source}");
                self.last_error = Some(source.to_string());
                Err(ReconnectError::Attempt { attempt, source })
            }
        }
    }
}
