//! Retry scheduler: exponential backoff with jitter and a bounded attempt budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::{ErrorKind, ProviderError};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_JITTER: f64 = 0.2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Upper bound on honoured `Retry-After` hints.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional spread applied symmetrically around the computed delay.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What to do with an operation whose dispatch just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeue, not to be dispatched before `at`.
    RetryAt {
        at: DateTime<Utc>,
        delay: Duration,
        /// Set when the delay came from the provider rather than backoff.
        rate_limited: bool,
    },
    /// Transient retries exhausted.
    GiveUp,
    /// Credential problem: never retried, provider gets disconnected.
    Reject,
    /// Malformed payload: dropped after one failure.
    Drop,
}

impl RetryPolicy {
    /// Delay before retry number `retry_count + 1`, jittered and capped.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponential = self.unjittered(retry_count).min(self.max_delay);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let factor = if jitter == 0.0 {
            1.0
        } else {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        };
        Duration::try_from_secs_f64(exponential.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn unjittered(&self, retry_count: u32) -> Duration {
        // Anything past 2^31 is already beyond the cap.
        let multiplier = 2u32.saturating_pow(retry_count.min(31));
        self.base_delay.saturating_mul(multiplier)
    }

    /// Classify a failure for an operation that has already failed
    /// `retry_count` times before this attempt.
    pub fn decide(
        &self,
        retry_count: u32,
        error: &ProviderError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match error.kind() {
            ErrorKind::AuthError => return RetryDecision::Reject,
            ErrorKind::ValidationError => return RetryDecision::Drop,
            ErrorKind::TransientError | ErrorKind::Conflict | ErrorKind::PermanentFailure => {}
        }

        if retry_count.saturating_add(1) >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let (delay, rate_limited) = match error.retry_after() {
            Some(hint) => (hint.min(MAX_RETRY_AFTER), true),
            None => (self.backoff_delay(retry_count), false),
        };
        let at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(1));
        RetryDecision::RetryAt {
            at,
            delay,
            rate_limited,
        }
    }
}
