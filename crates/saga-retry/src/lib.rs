//! Pure retry policy evaluation.
//!
//! `next_delay(n) = min(initial_interval * backoff_coefficient^(n-1), max_interval)`
//! and `should_retry(n, kind)` is false once `n >= max_attempts` or the error
//! is permanent.

use std::time::Duration;

use saga_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("backoff coefficient must be >= 1.0 (got {0})")]
    BackoffCoefficient(f64),

    #[error("initial interval {initial:?} exceeds maximum interval {max:?}")]
    IntervalOrder { initial: Duration, max: Duration },
}

/// Retry configuration for one action.
///
/// `max_attempts == 0` means attempts are unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
    backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Build a policy, validating its intervals and coefficient.
    ///
    /// # Errors
    ///
    /// Returns an error if `backoff_coefficient < 1.0` or
    /// `initial_interval > max_interval`.
    pub fn new(
        max_attempts: u32,
        initial_interval: Duration,
        max_interval: Duration,
        backoff_coefficient: f64,
    ) -> Result<Self, RetryPolicyError> {
        let policy = Self {
            max_attempts,
            initial_interval,
            max_interval,
            backoff_coefficient,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Default for compensating actions: more lenient than forward actions,
    /// since an undo that silently fails is worse than a slow one.
    #[must_use]
    pub fn compensation_default() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// See [`RetryPolicy::new`].
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.backoff_coefficient.is_nan() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::BackoffCoefficient(
                self.backoff_coefficient,
            ));
        }
        if self.initial_interval > self.max_interval {
            return Err(RetryPolicyError::IntervalOrder {
                initial: self.initial_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Also raises `max_interval` if it would fall below the new initial
    /// interval.
    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self.max_interval = self.max_interval.max(interval);
        self
    }

    /// Also lowers `initial_interval` if it would exceed the new maximum.
    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self.initial_interval = self.initial_interval.min(interval);
        self
    }

    /// Coefficients below 1.0 are clamped to 1.0.
    #[must_use]
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = if coefficient >= 1.0 { coefficient } else { 1.0 };
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }

    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    #[must_use]
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    #[must_use]
    pub fn backoff_coefficient(&self) -> f64 {
        self.backoff_coefficient
    }

    /// Delay to wait after failed attempt `attempt` (1-based) before the next one.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs).min(self.max_interval)
    }

    /// Whether failed attempt `attempt` (1-based) may be followed by another.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        if kind == ErrorKind::Permanent {
            return false;
        }
        self.is_unbounded() || attempt < self.max_attempts
    }
}
