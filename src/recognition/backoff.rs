//! Exponential backoff for the transcript poll loop.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,

    /// Total time the caller is willing to keep polling; `None` leaves the bound
    /// to the recognition deadline.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 1.5,
            max_elapsed: None,
        }
    }
}

/// Delay sequence `d0 = initial`, `d(n+1) = min(d(n) * multiplier, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    elapsed: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current = policy.initial_backoff.min(policy.max_backoff);
        Self {
            policy,
            current,
            elapsed: Duration::ZERO,
        }
    }

    /// Next delay to wait, or `None` once `max_elapsed` would be exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.current;
        if let Some(limit) = self.policy.max_elapsed {
            if self.elapsed + delay > limit {
                return None;
            }
        }

        self.elapsed += delay;
        let max_nanos = self.policy.max_backoff.as_nanos() as f64;
        let grown = (delay.as_nanos() as f64 * self.policy.multiplier.max(1.0)).round();
        self.current = Duration::from_nanos(grown.min(max_nanos) as u64);
        Some(delay)
    }

    /// Sum of the delays handed out so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
