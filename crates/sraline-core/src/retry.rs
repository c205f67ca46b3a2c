//! Bounded retry with exponential backoff

use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use crate::error::Retryable;
use crate::shutdown::CancelFlag;

/// Sleep granularity while waiting out a backoff, so cancellation is noticed quickly
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits; for tests and dry runs.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2·base, 4·base, … capped.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retry a fallible operation with exponential backoff.
///
/// On retryable errors, logs the failure, updates the progress line, sleeps,
/// and tries again until `policy.max_attempts` is used up. Cancellation stops
/// the loop early and returns the most recent error.
///
/// Returns `Ok(T)` on first success, or the final `Err` on exhaustion / non-retryable error.
pub fn retry_with_backoff<T, E>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    pb: &ProgressBar,
    mut attempt_fn: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match attempt_fn(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && e.is_retryable() && !cancel.is_cancelled() => {
                let delay = policy.backoff_duration(attempt);
                pb.set_message(format!("retry {attempt}/{max_attempts}..."));
                log::warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed: {e}, retrying in {delay:?}"
                );
                if !sleep_unless_cancelled(delay, cancel) {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => {
                log::error!("{label}: failed permanently after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}

/// Sleep for `delay`; returns `false` if cancelled before it elapsed.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}
