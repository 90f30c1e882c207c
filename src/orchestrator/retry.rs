use std::time::Duration;

/// How many times a worker is invoked for one task and how long to wait
/// between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts every invocation, the first included. Zero is
    /// raised to one so each task is attempted at least once.
    pub fn new(max_attempts: u32, base_delay: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt `attempt` (0-based):
    /// `base_delay * 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_backoff)
    }

    /// Whether another attempt follows the failed attempt `attempt`.
    pub fn has_attempt_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}
