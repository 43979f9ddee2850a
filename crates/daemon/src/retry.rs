//! Bounded retry with a fixed delay for filesystem steps.

use std::fmt::Display;
use std::thread;
use std::time::Duration;
use transcode_queue_config::RetryConfig;
use tracing::{debug, warn};

/// Attempt count and delay shared by finalization and temp cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts,
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy with no pause, used where the caller cannot afford to block.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// Blocks the calling thread between attempts; call from
    /// `spawn_blocking` when on the runtime. Returns the last error.
    pub fn run<T, E, F>(&self, name: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < attempts => {
                    warn!(op = name, attempt, attempts, error = %e, "attempt failed, retrying");
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
