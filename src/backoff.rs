//! Reconnect pacing utilities.
//!
//! The transport schedules its reconnect attempts through an explicit
//! [`Backoff`] value rather than ad-hoc timer arithmetic, so the growth and
//! reset rules live in one place and can be tested without a connection.

use std::time::Duration;

/// Policy controlling the delay between reconnect attempts.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt after a connection loss.
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay growth.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Returns the default pacing: 50 ms doubling up to 5 s.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Stateful delay sequence derived from a [`ReconnectPolicy`].
///
/// Each call to [`Backoff::next_delay`] returns the current delay and doubles
/// it, saturating at the policy ceiling. [`Backoff::reset`] rewinds to the
/// initial delay and must be called on every successful open.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let next = policy.initial_delay;
        Self { policy, next }
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(delay.saturating_mul(2), self.policy.max_delay);
        delay
    }

    /// Rewinds the sequence to the initial delay.
    pub fn reset(&mut self) {
        self.next = self.policy.initial_delay;
    }
}
