//! Exponential reconnect backoff.
//!
//! The supervisor owns one `Backoff` per pipeline and resets it whenever an
//! attempt made real progress, so a long-lived connection that finally drops
//! reconnects quickly instead of paying for its own uptime.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let next = policy.initial;
        Backoff { policy, next }
    }

    /// The delay to sleep before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        let scaled = self.next.as_secs_f64() * self.policy.multiplier;
        self.next = Duration::from_secs_f64(scaled).min(self.policy.max);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}
