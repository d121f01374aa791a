//! Convergence primitives.
//!
//! Hypervisor calls frequently return before the machine has actually
//! reached the requested state. This library provides the bounded
//! wait-and-recheck used to confirm such transitions:
//!
//! - **Settle window**: how long a transition may take to become observable.
//! - **Predicate**: a fallible check of the target condition.
//! - **Outcome**: reached, or timed out after a bounded number of attempts.
//!
//! # Invariants
//!
//! - A wait never blocks longer than `timeout + interval`
//! - The predicate is always evaluated at least once, and once more at the deadline
//! - Predicate errors abort the wait immediately

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default delay between two checks of the target condition.
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_millis(500);

/// Default maximum time allowed for a transition to settle.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound applied to the poll interval so a zero interval cannot spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Bounded poll policy for asynchronous state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlePolicy {
    /// Delay between two checks.
    #[serde(rename = "interval_ms", with = "millis", default = "default_interval")]
    pub interval: Duration,

    /// Maximum total wait.
    #[serde(rename = "timeout_ms", with = "millis", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_interval() -> Duration {
    DEFAULT_SETTLE_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_SETTLE_TIMEOUT
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SETTLE_INTERVAL,
            timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

/// Result of a settle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// The predicate held.
    Reached { attempts: u32, elapsed: Duration },

    /// The window closed without the predicate holding.
    TimedOut { attempts: u32, elapsed: Duration },
}

impl Settle {
    /// Returns true if the target condition was observed.
    pub fn is_reached(&self) -> bool {
        matches!(self, Self::Reached { .. })
    }

    /// Number of times the predicate was evaluated.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Reached { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Time spent waiting.
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Reached { elapsed, .. } | Self::TimedOut { elapsed, .. } => *elapsed,
        }
    }
}

impl SettlePolicy {
    /// Create a policy with the given interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// A policy that checks exactly once and never sleeps.
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }

    /// Poll `check` until it returns true or the window closes.
    pub fn wait_until<F, E>(&self, mut check: F) -> Result<Settle, E>
    where
        F: FnMut() -> Result<bool, E>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if check()? {
                return Ok(Settle::Reached {
                    attempts,
                    elapsed: started.elapsed(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Settle::TimedOut {
                    attempts,
                    elapsed: started.elapsed(),
                });
            }

            // Sleep no further than the deadline so the last check lands on it.
            let pause = self.interval.max(MIN_INTERVAL).min(deadline - now);
            trace!(attempts, pause_ms = pause.as_millis() as u64, "Target not reached yet");
            thread::sleep(pause);
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
