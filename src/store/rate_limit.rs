//! Sliding-window rate limiting for store calls.
//!
//! Unlike a reject-style limiter, [`RateLimiter::acquire`] never fails: when
//! the window is full it sleeps until the oldest call ages out.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Admits at most `max_calls` calls in any rolling `window`.
#[derive(Debug)]
pub struct RateLimiter {
    calls: VecDeque<Instant>,
    max_calls: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            calls: VecDeque::new(),
            max_calls: max_calls.max(1),
            window,
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    /// Waits until the window admits another call, records it, and returns
    /// how long the caller was held back.
    pub async fn acquire(&mut self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let now = Instant::now();
            self.evict(now);
            if self.calls.len() < self.max_calls {
                self.calls.push_back(now);
                let remaining = self.remaining();
                if remaining < self.max_calls / 10 {
                    debug!(remaining, limit = self.max_calls, "store call budget running low");
                }
                return waited;
            }
            let oldest = self.calls.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            warn!(
                wait_ms = wait.as_millis() as u64,
                limit = self.max_calls,
                "store rate limit reached, waiting"
            );
            sleep(wait).await;
            waited += wait;
        }
    }

    /// Calls still available in the current window.
    pub fn remaining(&mut self) -> usize {
        self.evict(Instant::now());
        self.max_calls - self.calls.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&front) = self.calls.front() {
            if now.duration_since(front) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_minute(90)
    }
}
