//! Synchronous retry with exponential back-off
//!
//! The shared metadata file is updated by the writer without locks, so
//! readers must re-read torn records. All retry loops in the system are
//! bounded and driven by a `RetryPolicy`: an initial delay that doubles on
//! each attempt up to a cap, for at most `max_attempts` attempts.
//!
//! The cooperative per-file model forbids async here; sleeps are plain
//! `std::thread::sleep`.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Bounded exponential back-off parameters
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Multiplier applied to the delay after each sleep
    pub multiplier: u32,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Maximum number of attempts (>= 1)
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_nanos(1),
            multiplier: 2,
            cap: Duration::from_millis(100),
            max_attempts: 100,
        }
    }
}

impl RetryPolicy {
    /// A policy that permits a single attempt and never sleeps
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Start a back-off cursor for one retry loop
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            delay: self.initial,
            multiplier: self.multiplier.max(1),
            cap: self.cap,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Cursor state for one bounded retry loop
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    multiplier: u32,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    /// Sleep before the next attempt.
    ///
    /// Returns `false` when all attempts are exhausted, in which case the
    /// caller must give up without retrying again.
    pub fn sleep(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;

        thread::sleep(self.delay);
        self.delay = (self.delay * self.multiplier).min(self.cap);
        true
    }

    /// Number of attempts still available after the current one
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_attempt_budget() {
        let policy = RetryPolicy {
            initial: Duration::from_nanos(1),
            multiplier: 2,
            cap: Duration::from_nanos(8),
            max_attempts: 4,
        };

        let mut backoff = policy.backoff();
        // 4 attempts total: the first is free, then 3 sleeps
        assert!(backoff.sleep());
        assert!(backoff.sleep());
        assert!(backoff.sleep());
        assert!(!backoff.sleep());
        assert!(!backoff.sleep());
    }

    #[test]
    fn test_backoff_delay_doubles_to_cap() {
        let policy = RetryPolicy {
            initial: Duration::from_nanos(1),
            multiplier: 2,
            cap: Duration::from_nanos(4),
            max_attempts: 16,
        };

        let mut backoff = policy.backoff();
        assert_eq!(backoff.delay, Duration::from_nanos(1));
        backoff.sleep();
        assert_eq!(backoff.delay, Duration::from_nanos(2));
        backoff.sleep();
        assert_eq!(backoff.delay, Duration::from_nanos(4));
        backoff.sleep();
        // Clamped at the cap
        assert_eq!(backoff.delay, Duration::from_nanos(4));
    }

    #[test]
    fn test_no_retry_policy() {
        let mut backoff = RetryPolicy::no_retry().backoff();
        assert!(!backoff.sleep());
    }
}
