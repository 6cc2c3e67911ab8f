//! Retry policy applied when a render worker reports a failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay schedule between a failure and the retried dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retried jobs are eligible again immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed,
    /// base * retry
    Linear,
    /// base * 2^(retry - 1)
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy {other:?}")),
        }
    }
}

/// Outcome of applying the policy to one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending with the incremented counter.
    Retry {
        retry_count: u32,
        not_before: Option<DateTime<Utc>>,
    },
    /// Terminal failure.
    GiveUp,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed jobs are retried at all
    pub enabled: bool,
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Base delay for the backoff schedule
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            backoff: BackoffStrategy::None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that fails jobs on their first error.
    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Immediate retries, up to `max_retries`.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, base: Duration, max: Duration) -> Self {
        self.backoff = backoff;
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Whether a job that has already been retried `retry_count` times gets another go.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        self.enabled && retry_count < self.max_retries
    }

    /// Delay before the `retry`-th retry (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    /// Decide what happens to a job that failed with `retry_count` prior retries.
    pub fn decide(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if !self.should_retry(retry_count) {
            return RetryDecision::GiveUp;
        }

        let next = retry_count + 1;
        let delay = self.delay_for_retry(next);
        let not_before = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
        };

        RetryDecision::Retry {
            retry_count: next,
            not_before,
        }
    }
}
