//! Exponential backoff with jitter and the retry/dead-letter decision.
//!
//! The backoff for a job that has made `n` attempts is
//! `min(base * 2^n + random(0, base), max)`. The random term is always
//! smaller than the gap between consecutive exponential steps, so delays stay
//! non-decreasing in `n` even with jitter enabled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

const MAX_EXPONENT: u32 = 32;

/// Backoff configuration shared by every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay multiplied by `2^attempts`.
    pub base_delay: Duration,

    /// Ceiling on any single delay, including `Retry-After`.
    pub max_delay: Duration,

    /// Adds `random(0, base_delay)` to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of a job that has made `attempts`
    /// attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempts.min(MAX_EXPONENT));
        let exponential = self.base_delay.checked_mul(multiplier).unwrap_or(self.max_delay);

        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter = if self.jitter && base_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..base_ms))
        } else {
            Duration::ZERO
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made including the one that just failed.
    pub attempts: u32,
    /// Attempt ceiling of the job.
    pub max_attempts: u32,
    /// Error that caused the delivery failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry - the job is dead-lettered.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempts: u32,
        max_attempts: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempts, max_attempts, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// Permanent failures and failures that reach the attempt ceiling give
    /// up. A 429 with a usable `Retry-After` is honored up to the policy's
    /// maximum delay; everything else uses exponential backoff.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return Duration::from_secs(retry_after_seconds).min(self.policy.max_delay);
        }

        self.policy.backoff(self.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy { jitter: false, ..Default::default() }
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = policy_without_jitter();

        assert_eq!(policy.backoff(0), Duration::from_secs(30));
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
    }

    #[test]
    fn backoff_capped_at_max_delay() {
        let policy = policy_without_jitter();

        assert_eq!(policy.backoff(7), Duration::from_secs(3600));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_below_one_base_delay() {
        let policy = RetryPolicy::default();

        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_secs(60));
            assert!(delay < Duration::from_secs(90));
        }
    }

    #[test]
    fn retry_scheduled_below_ceiling() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::server_error(500, ""),
            failed_at,
            policy_without_jitter(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(60) }
        );
    }

    #[test]
    fn retry_respects_maximum_attempts() {
        let context =
            RetryContext::new(3, 3, DeliveryError::timeout(30), Utc::now(), RetryPolicy::default());

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn non_retryable_errors_rejected() {
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::client_error(404, "not found"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("should not retry client errors"),
        }
    }

    #[test]
    fn retry_after_header_respected() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::rate_limited(Some(120)),
            failed_at,
            RetryPolicy::default(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(120) }
        );
    }

    #[test]
    fn retry_after_capped_at_max_delay() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            3,
            DeliveryError::rate_limited(Some(86_400)),
            failed_at,
            RetryPolicy::default(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(3600) }
        );
    }

    #[test]
    fn rate_limit_without_retry_after_uses_backoff() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            2,
            5,
            DeliveryError::rate_limited(None),
            failed_at,
            policy_without_jitter(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(120) }
        );
    }
}
