//! Reconnect policy -- bounded attempts with capped exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attempt 0 is the initial connect and is never delayed. Attempts
/// `1..=max_attempts` are reconnects, delayed `min(base * 2^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Shift saturation point; 2^20 * any sane base is past any sane cap.
const BACKOFF_SATURATION: u32 = 20;

impl ReconnectPolicy {
    /// Whether `attempt` is still inside the retry budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Deterministic delay before `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(BACKOFF_SATURATION);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `delay(attempt)` shortened by up to 20% so clients dropped together
    /// do not reconnect together.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            return delay;
        }
        let keep = rand::thread_rng().gen_range(0.8..=1.0);
        delay.mul_f64(keep)
    }
}

/// What to do when a reconnect lands on `SUBSCRIBED { resumed: false }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    /// The server lost the cursor: fail the subscription.
    #[default]
    Fail,
    /// Accept the fresh cursor and carry on; resources may be delivered twice.
    Restart,
}
