//! Reconnect backoff with a stable-connection reset.
//!
//! Each failed attempt doubles the delay, clamped to `max`. A link that
//! stays up for `stable_threshold` resets the delay to `min` when it drops;
//! a link that flaps sooner keeps growing the delay.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub stable_threshold: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(32),
            stable_threshold: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.min,
            connected_since: None,
        }
    }

    /// Delay before the next attempt. Doubles the following delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        delay
    }

    /// Peek at the delay `next_delay` would return.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_connected(&mut self, at: Instant) {
        self.connected_since = Some(at);
    }

    /// Record a link drop. Returns true if the link was stable and the delay reset.
    pub fn on_disconnected(&mut self, at: Instant) -> bool {
        let Some(since) = self.connected_since.take() else {
            return false;
        };
        if at.saturating_duration_since(since) >= self.policy.stable_threshold {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.min;
    }
}
