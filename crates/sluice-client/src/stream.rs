//! Caller-facing handle to one subscription.
//!
//! Pull with a timeout, adapt to a `futures` Stream, or hand a callback to
//! `consume`. Dropping the handle cancels the subscription.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use sluice_flow::{Delivery, DeliveryReceiver, FlowStats, Phase, StatsSnapshot, Terminal};
use sluice_protocol::Token;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ResourceStream {
    token: Token,
    receiver: DeliveryReceiver,
    cancel: CancellationToken,
    stats: Arc<FlowStats>,
    driver: Option<JoinHandle<Terminal>>,
}

impl ResourceStream {
    pub(crate) fn new(
        token: Token,
        receiver: DeliveryReceiver,
        cancel: CancellationToken,
        stats: Arc<FlowStats>,
        driver: Option<JoinHandle<Terminal>>,
    ) -> Self {
        Self {
            token,
            receiver,
            cancel,
            stats,
            driver,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Next delivery, or `None` if nothing arrived within `timeout`.
    /// A timeout does not affect the subscription.
    pub async fn next(&self, timeout: Duration) -> Option<Delivery> {
        self.receiver.pull(timeout).await
    }

    /// Next delivery, however long it takes.
    pub async fn recv(&self) -> Delivery {
        self.receiver.recv().await
    }

    /// Next delivery if one is already queued.
    pub fn try_next(&self) -> Option<Delivery> {
        self.receiver.try_pull()
    }

    /// Another consumer on the same FIFO. Each item reaches one consumer.
    pub fn receiver(&self) -> DeliveryReceiver {
        self.receiver.clone()
    }

    /// Ask the driver to stop. The stream then ends with `Cancelled`
    /// (unless it already finished).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn phase(&self) -> Phase {
        self.stats.phase()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the driver task to finish and return how it ended.
    /// Undelivered items stay in the queue.
    pub async fn finished(mut self) -> Terminal {
        match self.driver.take() {
            Some(driver) => match driver.await {
                Ok(terminal) => terminal,
                Err(e) => Terminal::Failed(format!("driver task aborted: {e}")),
            },
            None => match self.receiver.recv().await {
                Delivery::End(terminal) => terminal,
                Delivery::Item(_) => Terminal::Failed("no driver attached".into()),
            },
        }
    }

    /// Adapt into a `Stream` that yields every delivery, ending after the
    /// terminal marker.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + 'static {
        futures_util::stream::unfold(Some(self), |state| async move {
            let stream = state?;
            let delivery = stream.recv().await;
            let next = if delivery.is_end() { None } else { Some(stream) };
            Some((delivery, next))
        })
    }

    /// Run `on_delivery` for every delivery on a separate task, ending after
    /// the terminal marker. If the callback panics, only that task dies; the
    /// subscription is then cancelled.
    pub fn consume<F>(self, mut on_delivery: F) -> JoinHandle<Terminal>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let delivery = self.recv().await;
                if let Delivery::End(terminal) = &delivery {
                    let terminal = terminal.clone();
                    on_delivery(delivery);
                    return terminal;
                }
                on_delivery(delivery);
            }
        })
    }
}

impl Drop for ResourceStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ResourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStream")
            .field("token", &self.token)
            .field("phase", &self.phase())
            .finish()
    }
}
