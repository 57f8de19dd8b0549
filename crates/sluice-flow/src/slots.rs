//! Download slot tracker -- bounded gauge of concurrent downloads.
//!
//! Downloaders take a `Permit` before starting a transfer and give it back
//! when the transfer ends (dropping the permit releases it). The subscription
//! driver only reads the gauge before sending CTS. The tracker never blocks:
//! waiters subscribe to `changed()` and re-check.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

struct Inner {
    capacity: usize,
    in_use: AtomicUsize,
    changed: Notify,
}

/// Shared, cloneable handle. Clones share one budget.
#[derive(Clone)]
pub struct SlotTracker {
    inner: Arc<Inner>,
}

/// One occupied download slot. Released on drop.
#[must_use = "dropping a permit releases the slot immediately"]
pub struct Permit {
    inner: Arc<Inner>,
}

impl SlotTracker {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            tracing::warn!("slot capacity 0 would stall every subscription, using 1");
        }
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                in_use: AtomicUsize::new(0),
                changed: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.inner.capacity.saturating_sub(self.in_use())
    }

    pub fn has_capacity(&self) -> bool {
        self.available() > 0
    }

    /// Occupy one slot if any is free.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut current = self.inner.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.inner.capacity {
                return None;
            }
            match self.inner.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Permit {
                        inner: self.inner.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Give a slot back. Equivalent to dropping the permit.
    pub fn release(&self, permit: Permit) {
        if !Arc::ptr_eq(&self.inner, &permit.inner) {
            tracing::warn!("releasing a permit issued by a different slot tracker");
        }
        drop(permit);
    }

    /// Future that resolves the next time a slot is released.
    ///
    /// Enable it (or poll it once) before re-checking `has_capacity()`,
    /// otherwise a release between the check and the await is missed.
    pub fn changed(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }
}

impl std::fmt::Debug for SlotTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTracker")
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.in_use.fetch_sub(1, Ordering::AcqRel);
        self.inner.changed.notify_waiters();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}
