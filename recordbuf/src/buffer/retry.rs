use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::sync::{spin_loop, thread};

/// Pause between attempts once spinning and yielding have not helped.
pub const DEFAULT_PAUSE: Duration = Duration::from_micros(1);

// Steps 0..=SPIN_LIMIT spin 2^step times, the next few yield, then sleep.
const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// How long a status transition keeps retrying its compare-and-swap.
///
/// The default never gives up: a transition whose expected prior state never
/// shows up spins forever. `max_attempts` bounds that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub pause: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            pause: DEFAULT_PAUSE,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            step: 0,
            attempts: 0,
        }
    }
}

/// On-disk form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub pause_micros: u64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            pause_micros: DEFAULT_PAUSE.as_micros() as u64,
            max_attempts: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            pause: Duration::from_micros(cfg.pause_micros),
            max_attempts: cfg.max_attempts,
        }
    }
}

pub(crate) struct Backoff {
    policy: RetryPolicy,
    step: u32,
    attempts: u32,
}

impl Backoff {
    /// Wait before the next attempt. Returns `false` once the budget is spent.
    pub(crate) fn snooze(&mut self, offset: usize) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return false;
            }
        }

        if self.step <= SPIN_LIMIT {
            spin(self.step);
        } else if self.step <= YIELD_LIMIT {
            thread::yield_now();
        } else {
            pause(self.policy.pause);
        }

        if self.step <= YIELD_LIMIT {
            self.step += 1;
            if self.step > YIELD_LIMIT {
                warn!(offset, attempts = self.attempts, "status transition is still waiting");
            }
        }
        true
    }
}

#[cfg(not(feature = "loom"))]
#[inline]
fn spin(step: u32) {
    for _ in 0..(1u32 << step) {
        spin_loop();
    }
}

// Each spin is a scheduling point under loom.
#[cfg(feature = "loom")]
#[inline]
fn spin(_: u32) {
    spin_loop();
}

#[cfg(not(feature = "loom"))]
#[inline]
fn pause(duration: Duration) {
    thread::sleep(duration);
}

#[cfg(feature = "loom")]
#[inline]
fn pause(_: Duration) {
    thread::yield_now();
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_keeps_going() {
        let mut backoff = RetryPolicy::default().backoff();
        for _ in 0..(YIELD_LIMIT + 5) {
            assert!(backoff.snooze(0));
        }
    }

    #[test]
    fn bounded_policy_stops_at_budget() {
        let mut backoff = RetryPolicy::bounded(3).backoff();
        assert!(backoff.snooze(0));
        assert!(backoff.snooze(0));
        assert!(!backoff.snooze(0));
    }

    #[test]
    fn config_converts_to_policy() {
        let cfg = RetryConfig {
            pause_micros: 5,
            max_attempts: Some(10),
        };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.pause, Duration::from_micros(5));
        assert_eq!(policy.max_attempts, Some(10));
        assert_eq!(RetryPolicy::from(&RetryConfig::default()), RetryPolicy::default());
    }
}
