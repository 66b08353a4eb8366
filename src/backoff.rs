//! Exponential backoff shared by source reconnects and sink retries.

use std::time::Duration;

use rand::Rng;

/// `base * 2^attempt`, capped at `max`, with up to 20% additive jitter when enabled.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Deterministic variant, used where tests assert exact timings.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return delay;
        }
        let range_ms = (delay.as_millis() as u64) / 5;
        if range_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=range_ms);
        (delay + Duration::from_millis(jitter)).min(self.max)
    }
}
