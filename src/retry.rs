//! Support for deciding when to retry, and for waiting between attempts.

use std::time::Duration;

use reqwest::StatusCode;

use crate::prelude::*;

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries on errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

/// A fixed-delay retry budget, counted in retries after the first attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    /// How many retries we allow after the first attempt.
    pub retries: u32,
    /// How long to wait before each retry.
    pub backoff: Duration,
}

impl RetryBudget {
    /// Total number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Can we make another attempt after `attempt` (1-based)?
    pub fn can_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Log why we're retrying, and wait out the backoff.
    pub async fn wait_before_retry(&self, attempt: u32, reason: &str) {
        let remaining = self.max_attempts().saturating_sub(attempt);
        warn!(
            attempt,
            remaining,
            backoff_ms = self.backoff.as_millis() as u64,
            "Retrying: {}",
            reason
        );
        if !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_transient() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
    }

    #[test]
    fn budget_counts_first_attempt() {
        let budget = RetryBudget {
            retries: 3,
            backoff: Duration::ZERO,
        };
        assert_eq!(budget.max_attempts(), 4);
        assert!(budget.can_retry_after(3));
        assert!(!budget.can_retry_after(4));

        let none = RetryBudget {
            retries: 0,
            backoff: Duration::ZERO,
        };
        assert!(!none.can_retry_after(1));
    }
}
