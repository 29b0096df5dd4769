//! Bounded exponential backoff shared by retrieval and generation calls.
//!
//! Delay before retry `n` (1-based) is `base * 2^(n-1)`, capped at `max`,
//! then jittered by ±25%. Only errors that report themselves transient are
//! retried; anything else is returned after the first attempt. A cancelled
//! token stops the loop before the next attempt and interrupts any backoff
//! sleep.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProviderError, RetrievalError};

/// Default transient retries per call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default first backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
/// Default backoff cap in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 8000;

/// Errors that know whether retrying can help.
pub trait Retryable {
    /// `true` for timeouts, rate limits, and other passing conditions.
    fn is_transient(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Retryable for RetrievalError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// A non-transient error; returned without retrying.
    Permanent(E),
    /// Transient errors persisted through every retry.
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Final error.
        last: E,
    },
    /// The caller's token fired before the next attempt could start.
    Cancelled {
        /// Attempts that ran before cancellation.
        attempts: u32,
    },
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        )
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    /// Disables jitter (deterministic delays, used by tests).
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Retry ceiling.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        self.base
            .checked_mul(1_u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        if !self.jitter {
            return delay;
        }
        let factor = rand::random::<f64>().mul_add(0.5, 0.75);
        delay.mul_f64(factor)
    }

    /// Upper bound on total sleep across all retries (without jitter).
    #[must_use]
    pub fn max_total_wait(&self) -> Duration {
        (1..=self.max_retries).map(|r| self.base_delay(r)).sum()
    }

    /// Runs `operation` until it succeeds, fails permanently, the retry
    /// ceiling is reached, or `cancel` fires. `operation` receives the
    /// 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T, RetryOutcome<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);
        let mut attempt = 1;
        loop {
            if cancelled() {
                debug!(operation = label, attempt, "cancelled before attempt");
                return Err(RetryOutcome::Cancelled { attempts: attempt - 1 });
            }
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryOutcome::Permanent(err)),
                Err(err) if attempt > self.max_retries => {
                    return Err(RetryOutcome::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) if cancelled() => {
                    debug!(operation = label, attempt, error = %err, "cancelled after transient failure");
                    return Err(RetryOutcome::Cancelled { attempts: attempt });
                }
                Err(err) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, retrying"
                    );
                    if let Some(token) = cancel {
                        tokio::select! {
                            () = token.cancelled() => {
                                return Err(RetryOutcome::Cancelled { attempts: attempt });
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
