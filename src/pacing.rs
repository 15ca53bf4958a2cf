//! Per-worker call spacing
//!
//! Each publish worker owns one [`CallPacer`]. Spacing is enforced per worker,
//! not globally, so aggregate throughput grows with the worker count until the
//! destination's real limit pushes back with rate-limit responses.

use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between consecutive calls made by one worker
#[derive(Debug)]
pub struct CallPacer {
    /// Minimum spacing (zero = unpaced)
    min_interval: Duration,
    /// Earliest instant the next call may start
    next_allowed: Option<Instant>,
}

impl CallPacer {
    /// Create a pacer; `Duration::ZERO` disables spacing
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: None,
        }
    }

    /// Configured minimum spacing
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next call may start, then claim the slot
    pub async fn pace(&mut self) {
        if let Some(next) = self.next_allowed
            && next > Instant::now()
        {
            tokio::time::sleep_until(next).await;
        }
        if self.min_interval.is_zero() {
            self.next_allowed = None;
        } else {
            self.next_allowed = Some(Instant::now() + self.min_interval);
        }
    }

    /// Push the next call back by at least `delay`, e.g. after a `Retry-After` response
    pub fn hold_off(&mut self, delay: Duration) {
        let candidate = Instant::now() + delay;
        self.next_allowed = Some(match self.next_allowed {
            Some(current) if current > candidate => current,
            _ => candidate,
        });
    }
}
