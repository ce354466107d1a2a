//! Timeout and retry options carried on the per-call context.
//!
//! # Responsibilities
//! - Describe overall / per-attempt deadlines and the attempt budget
//! - Validate the relationship between the durations
//! - Derive an overall timeout when only a per-attempt budget is known
//!
//! # Design Decisions
//! - `max_attempts == 0` means "no retry loop, use the transport default"
//! - `max_attempts == 1` means a single attempt with no backoff
//! - Durations are `std::time::Duration`, so negativity is unrepresentable
//! - Derived budgets saturate at `Duration::MAX` instead of overflowing

use std::time::Duration;

use thiserror::Error;

use crate::resilience::backoff::{DEFAULT_BACKOFF_BETWEEN_ATTEMPTS, DEFAULT_SCALE_FACTOR};

/// Errors raised when building [`TimeoutAndRetryOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutOptionsError {
    /// A single attempt was allowed more time than the whole call.
    #[error("per-attempt timeout {per_attempt:?} exceeds overall timeout {overall:?}")]
    PerAttemptExceedsOverall {
        per_attempt: Duration,
        overall: Duration,
    },
}

/// Per-call override of timeouts and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutAndRetryOptions {
    /// Cap on the whole retry harness.
    pub overall_timeout: Duration,
    /// Deadline applied to each individual attempt.
    pub per_attempt_timeout: Duration,
    /// Number of attempts; 0 disables the retry loop.
    pub max_attempts: u32,
    /// Fixed sleep between two attempts.
    pub backoff_between_attempts: Duration,
}

impl TimeoutAndRetryOptions {
    /// Build validated options.
    pub fn new(
        overall_timeout: Duration,
        per_attempt_timeout: Duration,
        max_attempts: u32,
        backoff_between_attempts: Duration,
    ) -> Result<Self, TimeoutOptionsError> {
        if per_attempt_timeout > overall_timeout {
            return Err(TimeoutOptionsError::PerAttemptExceedsOverall {
                per_attempt: per_attempt_timeout,
                overall: overall_timeout,
            });
        }
        Ok(Self {
            overall_timeout,
            per_attempt_timeout,
            max_attempts,
            backoff_between_attempts,
        })
    }

    /// Derive options from a per-attempt budget.
    ///
    /// The overall timeout covers every attempt and every backoff, scaled by
    /// [`DEFAULT_SCALE_FACTOR`] to leave room for scheduling jitter.
    pub fn from_per_attempt(per_attempt_timeout: Duration, max_attempts: u32) -> Self {
        let attempts = max_attempts.max(1);
        let budget = per_attempt_timeout
            .saturating_mul(attempts)
            .saturating_add(DEFAULT_BACKOFF_BETWEEN_ATTEMPTS.saturating_mul(attempts - 1));
        let overall_timeout =
            Duration::try_from_secs_f64(budget.as_secs_f64() * DEFAULT_SCALE_FACTOR)
                .unwrap_or(Duration::MAX);
        Self {
            overall_timeout,
            per_attempt_timeout,
            max_attempts,
            backoff_between_attempts: DEFAULT_BACKOFF_BETWEEN_ATTEMPTS,
        }
    }

    /// Whether the retry loop is enabled at all.
    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_per_attempt_longer_than_overall() {
        let err = TimeoutAndRetryOptions::new(
            Duration::from_millis(100),
            Duration::from_millis(200),
            2,
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds overall timeout"));
    }

    #[test]
    fn derived_overall_covers_all_attempts() {
        let opts = TimeoutAndRetryOptions::from_per_attempt(Duration::from_millis(500), 2);
        assert_eq!(opts.backoff_between_attempts, Duration::from_millis(10));
        assert!(opts.overall_timeout >= Duration::from_millis(1010));
        assert!(opts.retries_enabled());
    }

    #[test]
    fn huge_budgets_saturate() {
        let opts = TimeoutAndRetryOptions::from_per_attempt(Duration::MAX, u32::MAX);
        assert_eq!(opts.overall_timeout, Duration::MAX);
        assert_eq!(opts.per_attempt_timeout, Duration::MAX);

        let opts = TimeoutAndRetryOptions::from_per_attempt(Duration::from_secs(u64::MAX / 2), 3);
        assert_eq!(opts.overall_timeout, Duration::MAX);
    }

    #[test]
    fn zero_attempts_disables_loop() {
        let opts = TimeoutAndRetryOptions::from_per_attempt(Duration::from_millis(50), 0);
        assert!(!opts.retries_enabled());
    }
}
