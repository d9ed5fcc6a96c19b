//! Retry policy for chunk OCR attempts.
//!
//! The scheduler consults a [`RetryPolicy`] after every failed attempt, so the
//! backoff schedule can be tested without an OCR call:
//!
//! - retryable error and attempts left → back off, then retry
//! - terminal error or attempts exhausted → chunk fails
//! - backoff: `base`, `2·base`, `4·base`, … capped at `max_delay`

use std::time::Duration;

use crate::error::ChunkOcrError;

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide after `attempts_made` attempts, the last of which failed with `err`.
    pub fn decide(&self, err: &ChunkOcrError, attempts_made: u32) -> RetryDecision {
        if err.is_retryable() && attempts_made < self.max_attempts {
            RetryDecision::RetryAfter(self.delay_for(attempts_made))
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(4), Duration::from_secs(5));
        assert_eq!(p.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_retryable_errors_retry_until_budget_spent() {
        let p = policy();
        let err = ChunkOcrError::Timeout(Duration::from_secs(90));
        assert_eq!(p.decide(&err, 1), RetryDecision::RetryAfter(Duration::from_secs(1)));
        assert_eq!(p.decide(&err, 2), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(p.decide(&err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_terminal_errors_never_retry() {
        let p = policy();
        let err = ChunkOcrError::MalformedInput("not a pdf".into());
        assert_eq!(p.decide(&err, 1), RetryDecision::GiveUp);
    }
}
