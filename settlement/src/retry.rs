//! Retry policy for failed settlement payments
//!
//! Exponential backoff with jitter. Retries are scheduled, not slept on: a
//! failed batch gets a `next_retry_at` and the scheduler picks it up once due.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt before the batch goes to manual review
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
    /// Growth per retry
    pub backoff_multiplier: f64,
    /// Relative jitter, 0.1 = ±10%
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2000,      // 2 seconds
            max_delay_ms: 300_000,       // 5 minutes
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,          // 10% jitter
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time
    RetryAt(DateTime<Utc>),
    /// Out of retries
    Escalate,
}

/// Backoff calculator
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
}

impl RetryStrategy {
    /// Create from a policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Default policy
    pub fn with_defaults() -> Self {
        Self::new(RetryPolicy::default())
    }

    /// The policy in force
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> std::time::Duration {
        let base_delay = self.policy.initial_delay_ms as f64
            * self.policy.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);

        // Cap at max_delay
        let capped_delay = base_delay.min(self.policy.max_delay_ms as f64);

        let jitter_range = capped_delay * self.policy.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        std::time::Duration::from_millis(final_delay as u64)
    }

    /// Decide what follows failed attempt number `attempts` (1-based)
    pub fn decide(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts > self.policy.max_retries {
            return RetryDecision::Escalate;
        }
        let delay = self.delay_for(attempts.saturating_sub(1));
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::milliseconds(0));
        RetryDecision::RetryAt(now + delay)
    }
}
