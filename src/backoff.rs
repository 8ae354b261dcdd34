//! Exponential backoff policy for automatic reconnection.

use std::time::Duration;

/// `delay(n) = min(base * 2^(n-1), max)` for attempt `n >= 1`; no attempt is
/// made past `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before automatic attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// The next attempt number and its delay, or `None` once exhausted.
    pub fn next_attempt(&self, attempts_so_far: u32) -> Option<(u32, Duration)> {
        let attempt = attempts_so_far.saturating_add(1);
        if attempt > self.max_attempts {
            None
        } else {
            Some((attempt, self.delay(attempt)))
        }
    }
}
