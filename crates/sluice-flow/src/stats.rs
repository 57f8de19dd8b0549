//! Per-subscription counters, shared between the driver task and handles.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use crate::machine::Phase;

#[derive(Debug)]
pub struct FlowStats {
    /// CTS frames written to the transport.
    pub cts_sent: AtomicU64,
    /// RESOURCE items pushed to the delivery queue.
    pub resources: AtomicU64,
    /// ERROR items pushed to the delivery queue.
    pub errors: AtomicU64,
    /// Transport losses that triggered a reconnect.
    pub reconnects: AtomicU64,
    /// Frames ignored as protocol violations.
    pub violations: AtomicU64,
    phase: AtomicU8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub phase: &'static str,
    pub cts_sent: u64,
    pub resources: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub violations: u64,
}

impl FlowStats {
    pub fn new() -> Self {
        Self {
            cts_sent: AtomicU64::new(0),
            resources: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            phase: AtomicU8::new(Phase::Idle as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            phase: self.phase().name(),
            cts_sent: self.cts_sent.load(Ordering::Relaxed),
            resources: self.resources.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }
}

impl Default for FlowStats {
    fn default() -> Self {
        Self::new()
    }
}
