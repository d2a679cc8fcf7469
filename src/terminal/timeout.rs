//! Command Deadlines
//!
//! Every process invocation runs under a deadline derived from a fixed
//! per-command timeout. The deadline is an absolute instant so it can be
//! shared across the output phase and the exit-wait phase of one run.

use std::time::Duration;
use tokio::time::{self, Instant, Sleep};

/// Default per-command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Per-command timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeout {
    duration: Duration,
}

impl Default for CommandTimeout {
    fn default() -> Self {
        Self::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)
    }
}

impl CommandTimeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Start the clock for one run
    pub fn start(&self) -> Deadline {
        Deadline {
            at: Instant::now() + self.duration,
        }
    }
}

/// Absolute deadline for a single run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Future that completes when the deadline passes
    pub fn expired(&self) -> Sleep {
        time::sleep_until(self.at)
    }
}
