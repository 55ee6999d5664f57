//! Retry and escalation policies.
//!
//! Two bounded policies keep the monitor from blocking forever on a wedged
//! link: [`RetryPolicy`] bounds how often a single operation (a sweep) is
//! re-attempted, and [`FailureBudget`] bounds how many consecutive iterations
//! may fail on the link before the loop gives up and reports to the operator.

use std::time::Duration;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the first retry; doubles for each further retry.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy with `retries` attempts after the first one.
    pub fn with_retries(retries: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Counts consecutive link failures against a threshold.
#[derive(Clone, Debug)]
pub struct FailureBudget {
    limit: u32,
    consecutive: u32,
}

impl FailureBudget {
    /// Budget that is exhausted after `limit` consecutive failures.
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    /// Record a failure; returns `true` once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.is_exhausted()
    }

    /// Record a success, resetting the count.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Failures since the last success.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Whether the threshold has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.consecutive >= self.limit
    }
}
