//! Bounded retry around the AI-backed steps.
//!
//! Every attempt sends the identical prompt and context. Any failure, whether
//! transport or validation, is retried until the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::ModelError;
use crate::validate::ValidationError;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed,
    /// Doubling delay capped at `max_delay`, optionally with jitter in
    /// `[delay / 2, delay]`.
    Exponential { max_delay: Duration, jitter: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait before attempt number `next_attempt` (2 for the first retry).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay, jitter } => {
                let exponent = next_attempt.saturating_sub(2).min(16);
                let base = self
                    .delay
                    .checked_mul(1 << exponent)
                    .unwrap_or(max_delay)
                    .min(max_delay);
                if jitter {
                    base.mul_f64(0.5 + fastrand::f64() * 0.5)
                } else {
                    base
                }
            }
        }
    }
}

/// Failure of a single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StepError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            StepError::Model(ModelError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: StepError },
    #[error("cancelled")]
    Cancelled,
}

/// Run `step` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// `step` receives the 1-based attempt number. `on_failure` is called after
/// every failed attempt, including the last. A rate-limit error carrying a
/// `Retry-After` stretches the next wait to at least that long. Cancellation
/// is observed both while an attempt is in flight and while waiting.
pub async fn invoke<T, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut step: F,
    mut on_failure: impl FnMut(u32, &StepError),
) -> Result<T, InvokeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
            outcome = step(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(step = name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        tracing::warn!(step = name, attempt, max_attempts, error = %error, "attempt failed");
        on_failure(attempt, &error);

        if attempt >= max_attempts {
            return Err(InvokeError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let mut wait = policy.delay_before(attempt + 1);
        if let Some(retry_after) = error.retry_after() {
            wait = wait.max(retry_after);
        }
        tracing::debug!(step = name, wait_secs = wait.as_secs_f64(), "waiting before retry");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}
