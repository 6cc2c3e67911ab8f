//! Queue configuration.
//!
//! Defaults match a single render backend that should only ever see one job
//! at a time. Every option can be overridden from the environment with a
//! `RENDERQ_` variable; see [`QueueConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffStrategy, RetryPolicy};

pub const ENV_MAX_CONCURRENT_RENDERS: &str = "RENDERQ_MAX_CONCURRENT_RENDERS";
pub const ENV_MAX_QUEUE_SIZE: &str = "RENDERQ_MAX_QUEUE_SIZE";
pub const ENV_JOB_TIMEOUT_SECS: &str = "RENDERQ_JOB_TIMEOUT_SECS";
pub const ENV_RETRY_FAILED_JOBS: &str = "RENDERQ_RETRY_FAILED_JOBS";
pub const ENV_MAX_RETRIES: &str = "RENDERQ_MAX_RETRIES";
pub const ENV_RETRY_BACKOFF: &str = "RENDERQ_RETRY_BACKOFF";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "RENDERQ_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "RENDERQ_RETRY_MAX_DELAY_MS";
pub const ENV_TICK_INTERVAL_MS: &str = "RENDERQ_TICK_INTERVAL_MS";
pub const ENV_COMPLETED_RETENTION_SECS: &str = "RENDERQ_COMPLETED_RETENTION_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrency gate: jobs processing at once
    pub max_concurrent_renders: usize,
    /// Admission cap across pending, processing, completed and failed jobs
    pub max_queue_size: usize,
    /// Processing time after which a job is reported as overdue (never failed)
    pub job_timeout: Duration,
    pub retry_failed_jobs: bool,
    pub max_retries: u32,
    pub retry_backoff: BackoffStrategy,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Period of the safety-net dispatch tick
    pub tick_interval: Duration,
    /// Completed and cancelled jobs older than this are purged by the tick
    pub completed_retention: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_renders: 1,
            max_queue_size: 100,
            job_timeout: Duration::from_secs(60 * 60),
            retry_failed_jobs: true,
            max_retries: 2,
            retry_backoff: BackoffStrategy::None,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            completed_retention: None,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent_renders(mut self, max: usize) -> Self {
        self.max_concurrent_renders = max;
        self
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, enabled: bool, max_retries: u32) -> Self {
        self.retry_failed_jobs = enabled;
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(
        mut self,
        strategy: BackoffStrategy,
        base: Duration,
        max: Duration,
    ) -> Self {
        self.retry_backoff = strategy;
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = Some(retention);
        self
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry_failed_jobs,
            max_retries: self.max_retries,
            backoff: self.retry_backoff,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_renders == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_renders must be at least 1".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "max_queue_size must be at least 1".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "tick_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `RENDERQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `RENDERQ_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, ENV_MAX_CONCURRENT_RENDERS)? {
            config.max_concurrent_renders = v;
        }
        if let Some(v) = parse(&lookup, ENV_MAX_QUEUE_SIZE)? {
            config.max_queue_size = v;
        }
        if let Some(secs) = parse(&lookup, ENV_JOB_TIMEOUT_SECS)? {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_bool(&lookup, ENV_RETRY_FAILED_JOBS)? {
            config.retry_failed_jobs = v;
        }
        if let Some(v) = parse(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = v;
        }
        if let Some(v) = parse(&lookup, ENV_RETRY_BACKOFF)? {
            config.retry_backoff = v;
        }
        if let Some(ms) = parse(&lookup, ENV_RETRY_BASE_DELAY_MS)? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_RETRY_MAX_DELAY_MS)? {
            config.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_TICK_INTERVAL_MS)? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, ENV_COMPLETED_RETENTION_SECS)? {
            config.completed_retention = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}
