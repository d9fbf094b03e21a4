//! Exponential backoff with cancellation.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff schedule.
///
/// The delay after failed attempt `n` (1-based) is
/// `base_delay * multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Attempts actually made, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
        }
    }

    /// Sum of all delays when every attempt fails.
    pub fn total_delay(&self) -> Duration {
        (1..self.attempts())
            .map(|n| self.delay_for(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why [`retry`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error.
    #[error("non-retryable failure: {0}")]
    Fatal(E),

    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The cancellation token fired before the operation succeeded.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts
/// or `cancel` fires.
///
/// The operation receives the 1-based attempt number. Backoff sleeps race
/// the cancellation token; a token cancelled before the first attempt
/// yields `Cancelled { attempts: 0, .. }`.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last,
            });
        }

        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted { attempts: attempt, last: e })
            }
            Err(e) => e,
        };

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "backing off before next attempt"
        );
        last = Some(error);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt, last });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
