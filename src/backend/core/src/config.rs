//! Configuration management.

use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ErrorCode, Result, RollupError};
use crate::jobs::{
    default_worker_count, validate_metric_name, AggregationPeriod, BatchConfig, WorkerPoolConfig,
};
use crate::telemetry::LoggingConfig;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis lease store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Scheduling, batching and worker configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every lease key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone the calendar triggers fire in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Periods with a calendar trigger
    #[serde(default = "default_periods")]
    pub periods: Vec<AggregationPeriod>,

    /// Metrics rolled up on every firing
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    /// Idle time after the last submission before a partial batch is flushed
    #[serde(default = "default_batch_interval", with = "humantime_serde")]
    pub batch_interval: Duration,

    /// Jobs per batch before an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Workers per batch (0 = four per CPU)
    #[serde(default)]
    pub worker_count: usize,

    /// Time a batch may run before remaining results are abandoned
    #[serde(default = "default_batch_deadline", with = "humantime_serde")]
    pub batch_deadline: Duration,

    /// Time a single job may spend on its aggregation and insert
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Buffered submissions waiting for the accumulator
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            periods: default_periods(),
            metrics: default_metrics(),
            batch_interval: default_batch_interval(),
            max_batch_size: default_max_batch_size(),
            worker_count: 0,
            batch_deadline: default_batch_deadline(),
            job_timeout: default_job_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Parse the configured timezone.
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            RollupError::with_internal(
                ErrorCode::InvalidTimezone,
                format!("Unknown IANA timezone: {}", self.timezone),
                e.to_string(),
            )
        })
    }

    /// Worker count with the CPU-derived default applied.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            default_worker_count()
        } else {
            self.worker_count
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            interval: self.batch_interval,
            max_batch_size: self.max_batch_size,
            worker_count: self.effective_worker_count(),
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            deadline: self.batch_deadline,
            ..WorkerPoolConfig::default()
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(RollupError::invalid_config("scheduler.max_batch_size must be at least 1"));
        }
        if self.batch_interval.is_zero() {
            return Err(RollupError::invalid_config("scheduler.batch_interval must be non-zero"));
        }
        if self.batch_deadline.is_zero() {
            return Err(RollupError::invalid_config("scheduler.batch_deadline must be non-zero"));
        }
        if self.job_timeout.is_zero() {
            return Err(RollupError::invalid_config("scheduler.job_timeout must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(RollupError::invalid_config("scheduler.queue_capacity must be at least 1"));
        }
        self.timezone()?;
        for metric in &self.metrics {
            validate_metric_name(metric)?;
        }
        Ok(())
    }
}

fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "rollup:lease:".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_timezone() -> String { "Australia/Perth".to_string() }
fn default_periods() -> Vec<AggregationPeriod> {
    vec![
        AggregationPeriod::Daily,
        AggregationPeriod::Weekly,
        AggregationPeriod::Monthly,
        AggregationPeriod::Yearly,
    ]
}
fn default_metrics() -> Vec<String> { vec!["rainfallHourly".to_string()] }
fn default_batch_interval() -> Duration { Duration::from_secs(1) }
fn default_max_batch_size() -> usize { 100 }
fn default_batch_deadline() -> Duration { Duration::from_secs(30) }
fn default_job_timeout() -> Duration { Duration::from_secs(10) }
fn default_queue_capacity() -> usize { 1024 }

fn environment() -> config::Environment {
    config::Environment::with_prefix("ROLLUP")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("scheduler.periods")
        .with_list_parse_key("scheduler.metrics")
        .try_parsing(true)
}

impl Config {
    /// Load configuration from `ROLLUP__*` environment variables, reading a
    /// `.env` file first if one exists.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a file, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            return Err(RollupError::invalid_config("redis.url must not be empty"));
        }
        self.scheduler.validate()
    }
}
