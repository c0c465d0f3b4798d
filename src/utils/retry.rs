use std::fmt::Display;
use std::thread;
use std::time::Duration;

use log::warn;

/// Bounded retries with exponential backoff.
/// Suggested `max_attempts = 4`, `initial_wait = Duration::from_millis(500)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            initial_wait: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            initial_wait: Duration::ZERO,
        }
    }

    /// Call `f` until it succeeds, fails with an error that isn't transient,
    /// or runs out of attempts.  The last error is returned.
    pub fn run<T, E, F, P>(&self, mut f: F, is_transient: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0;
        let mut wait_duration = self.initial_wait;

        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts || !is_transient(&e) {
                        return Err(e);
                    }
                    warn!(
                        "retrying after error: {} (attempt {}/{})",
                        e, attempts, self.max_attempts
                    );
                    thread::sleep(wait_duration);
                    wait_duration *= 2;
                }
            }
        }
    }
}
