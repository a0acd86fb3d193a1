//! Retry policy applied when a job attempt fails.
//!
//! The persisted attempt counter is the only attempt counter: queue
//! redelivery never decides anything by itself.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use vibevault_core::{defaults, Error, Result};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job, claimable after `delay`.
    Retry { delay: Duration },
    /// Mark the job (and its link) failed.
    GiveUp,
}

/// Named retry policy.
///
/// String forms: `fail_fast`, `max_attempts:N`, `max_attempts:N:BASE_MS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// First failure is final.
    FailFast,
    /// Up to `max_attempts` claims, with exponential backoff between them.
    MaxAttempts {
        max_attempts: i32,
        backoff_base: Duration,
    },
}

impl RetryPolicy {
    pub fn max_attempts(max_attempts: i32) -> Self {
        RetryPolicy::MaxAttempts {
            max_attempts,
            backoff_base: Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
        }
    }

    /// Default for the push runner: three attempts.
    pub fn push_default() -> Self {
        Self::max_attempts(defaults::JOB_MAX_ATTEMPTS)
    }

    /// Default for the poll runner: no automatic retry.
    pub fn poll_default() -> Self {
        RetryPolicy::FailFast
    }

    /// Decide after a failure, given the attempts made so far (including
    /// the one that just failed).
    pub fn decide(&self, attempts: i32) -> RetryDecision {
        match *self {
            RetryPolicy::FailFast => RetryDecision::GiveUp,
            RetryPolicy::MaxAttempts {
                max_attempts,
                backoff_base,
            } => {
                if attempts >= max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry {
                        delay: backoff_delay(backoff_base, attempts),
                    }
                }
            }
        }
    }
}

/// `base × 2^(attempts−1)`, capped.
fn backoff_delay(base: Duration, attempts: i32) -> Duration {
    let cap = Duration::from_millis(defaults::JOB_BACKOFF_MAX_MS);
    let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
    base.saturating_mul(1u32 << exponent).min(cap)
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::FailFast => f.write_str("fail_fast"),
            RetryPolicy::MaxAttempts {
                max_attempts,
                backoff_base,
            } => write!(
                f,
                "max_attempts:{}:{}",
                max_attempts,
                backoff_base.as_millis()
            ),
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid retry policy: {s}"));
        let mut parts = s.trim().split(':');

        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("fail_fast") if parts.next().is_none() => Ok(RetryPolicy::FailFast),
            Some("max_attempts") => {
                let max_attempts = match parts.next() {
                    Some(n) => n.parse::<i32>().map_err(|_| invalid())?,
                    None => defaults::JOB_MAX_ATTEMPTS,
                };
                if max_attempts < 1 {
                    return Err(invalid());
                }
                let backoff_base = match parts.next() {
                    Some(ms) => Duration::from_millis(ms.parse::<u64>().map_err(|_| invalid())?),
                    None => Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
                };
                if parts.next().is_some() {
                    return Err(invalid());
                }
                Ok(RetryPolicy::MaxAttempts {
                    max_attempts,
                    backoff_base,
                })
            }
            _ => Err(invalid()),
        }
    }
}
