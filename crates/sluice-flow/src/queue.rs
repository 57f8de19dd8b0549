//! Delivery queue -- ordered hand-off from the subscription driver to callers.
//!
//! Bounded: when the consumer stalls, `push` waits, which in turn delays the
//! next CTS and throttles the server. The terminal marker lives beside the
//! channel rather than in it, so closing never waits on a full queue and the
//! marker is always observed after every item.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::item::{Delivery, ResourceItem, Terminal};

/// Default number of undelivered items before `push` applies backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("delivery queue already closed with a terminal marker")]
    Closed,
    #[error("all consumers dropped the delivery queue")]
    ConsumerGone,
}

type TerminalSlot = Arc<Mutex<Option<Terminal>>>;

/// Producer half. Owned by exactly one subscription driver.
pub struct DeliverySender {
    tx: Option<mpsc::Sender<ResourceItem>>,
    terminal: TerminalSlot,
}

/// Consumer half. Clones share one FIFO; each item goes to exactly one puller.
#[derive(Clone)]
pub struct DeliveryReceiver {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ResourceItem>>>,
    terminal: TerminalSlot,
}

/// Create a bounded queue.
pub fn delivery_queue(capacity: usize) -> (DeliverySender, DeliveryReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let terminal: TerminalSlot = Arc::new(Mutex::new(None));
    (
        DeliverySender {
            tx: Some(tx),
            terminal: terminal.clone(),
        },
        DeliveryReceiver {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            terminal,
        },
    )
}

impl DeliverySender {
    /// Append an item, waiting while the queue is full.
    pub async fn push(&self, item: ResourceItem) -> Result<(), QueueError> {
        let Some(tx) = &self.tx else {
            tracing::error!(
                seq = item.seq(),
                token = item.token(),
                "push after terminal marker rejected"
            );
            return Err(QueueError::Closed);
        };
        tx.send(item).await.map_err(|_| QueueError::ConsumerGone)
    }

    /// Append the terminal marker. Nothing may be pushed afterwards.
    pub fn close(&mut self, terminal: Terminal) -> Result<(), QueueError> {
        if self.tx.is_none() {
            tracing::error!(%terminal, "second terminal marker rejected");
            return Err(QueueError::Closed);
        }
        if let Ok(mut slot) = self.terminal.lock() {
            *slot = Some(terminal);
        }
        // Dropping the sender lets consumers drain what is buffered, then
        // observe the marker.
        self.tx = None;
        Ok(())
    }

    /// True once every receiver has been dropped.
    pub fn consumer_gone(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Resolves when every receiver has been dropped.
    pub async fn consumer_dropped(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

impl DeliveryReceiver {
    /// Next delivery, or `None` if nothing arrived within `timeout`.
    ///
    /// A timeout leaves the subscription untouched. After the terminal
    /// marker has been seen, every further pull returns it again.
    pub async fn pull(&self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Next delivery, waiting as long as it takes.
    pub async fn recv(&self) -> Delivery {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(item) => Delivery::Item(item),
            None => Delivery::End(self.terminal()),
        }
    }

    /// Next delivery if one is ready right now.
    pub fn try_pull(&self) -> Option<Delivery> {
        let mut rx = self.rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(item) => Some(Delivery::Item(item)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Delivery::End(self.terminal())),
        }
    }

    fn terminal(&self) -> Terminal {
        self.terminal
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| Terminal::Failed("subscription ended without a terminal marker".into()))
    }
}
