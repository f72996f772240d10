//! Retry with pure exponential backoff.
//!
//! Attempt *i* that fails is followed by a sleep of `initial_delay * 2^(i-1)` before attempt
//! *i+1*. There is no jitter. Errors that [`MirrorError::is_retryable`] rejects are returned
//! immediately without consuming the remaining budget. Every failed attempt, retryable or not, is
//! reported to the observer once.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::observer::{RetryEvent, TransferObserver};

/// Serializable retry settings, validated into a [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Result<Backoff> {
        Backoff::new(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_attempts: u32,
    initial_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(MirrorError::config("max_attempts must be at least 1"));
        }
        if initial_delay.is_zero() {
            return Err(MirrorError::config("initial retry delay must be positive"));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the 1-based `attempt` fails.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        observer: &dyn TransferObserver,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let retryable = err.is_retryable();
            let next_delay =
                (retryable && attempt < self.max_attempts).then(|| self.delay_after(attempt));
            observer.attempt_failed(&RetryEvent {
                operation,
                attempt,
                max_attempts: self.max_attempts,
                next_delay,
                error: &err,
            });
            if !retryable {
                return Err(err);
            }

            match next_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    return Err(MirrorError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: Box::new(err),
                    })
                }
            }
        }
    }
}
