//! # Retry
//!
//! Backoff between attempts that failed for transient reasons.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Exponential backoff: `initial_interval * backoff_coefficient ^ (attempt - 1)`,
/// capped at `maximum_interval` when one is set.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failure.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Interval to wait after `attempt` consecutive failures. `attempt` 0 means
    /// nothing failed and there is nothing to wait for.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        if attempt == 0 {
            return time::Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(60)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
