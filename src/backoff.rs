//! Exponential backoff shared by every retry loop.
//!
//! A `Backoff` is plain state: callers record failures with [`Backoff::more`]
//! (which hands back the delay to wait) and successes with
//! [`Backoff::reset`]. Nothing sleeps implicitly except [`retry`], which
//! threads a caller-owned `Backoff` through a bounded number of attempts.

use crate::errors::{Result, StreamError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            attempts: 0,
            min,
            max: max.max(min),
        }
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Record a failure and return how long to wait before trying again.
    pub fn more(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    /// Delay the next call to [`Backoff::more`] would return.
    pub fn peek(&self) -> Duration {
        self.delay_for(self.attempts.saturating_add(1))
    }

    pub fn reset(&mut self) {
        if self.attempts > 0 {
            log::debug!("Backoff reset after {} failures", self.attempts);
        }
        self.attempts = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 * min overflows long before the cap matters
        let exponent = attempt.saturating_sub(1).min(31);
        self.min
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Run `op` up to `max_tries` times, sleeping `backoff.more()` between
/// failures. The attempt number (starting at 1) is passed in; the last error
/// is returned when every attempt fails.
pub fn retry<T, F>(backoff: &mut Backoff, max_tries: u32, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_tries = max_tries.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(e) if attempt >= max_tries => return Err(e),
            Err(e) => {
                let delay = backoff.more();
                log::debug!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    max_tries,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Convenience for loops that only care about reaching a state.
pub fn retry_until<F>(backoff: &mut Backoff, max_tries: u32, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    retry(backoff, max_tries, |_| {
        if check() {
            Ok(())
        } else {
            Err(StreamError::StaleDataTimeout(what.to_string()))
        }
    })
}
