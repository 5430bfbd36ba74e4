//! Error handling for the rollup scheduler.
//!
//! This module provides:
//! - A single crate error type with a machine-readable [`ErrorCode`]
//! - User-facing vs internal messages
//! - Severity-driven logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Job-level failures have their own taxonomy in [`crate::jobs::JobError`];
//! anything that crosses a job boundary is converted there.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rollup_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_batch_size(raw: &str) -> Result<usize> {
//!     raw.parse::<usize>().with_error_code(ErrorCode::InvalidConfiguration)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for rollup operations.
pub type Result<T> = std::result::Result<T, RollupError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Lease Errors (1000-1099)
    LeaseBackendUnavailable,
    LeaseBackendError,
    InvalidLease,

    // Store Errors (1100-1199)
    StoreQueryFailed,
    StoreInsertFailed,

    // Job Errors (1200-1299)
    AggregationEmpty,
    RowConversionFailed,
    JobTimeout,
    JobPanicked,

    // Batch Errors (1300-1399)
    BatchDeadlineExceeded,
    SubmissionClosed,

    // Schedule Errors (1400-1499)
    InvalidPipeline,
    InvalidSchedule,
    InvalidTimezone,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::LeaseBackendUnavailable => 1000,
            Self::LeaseBackendError => 1001,
            Self::InvalidLease => 1002,

            Self::StoreQueryFailed => 1100,
            Self::StoreInsertFailed => 1101,

            Self::AggregationEmpty => 1200,
            Self::RowConversionFailed => 1201,
            Self::JobTimeout => 1202,
            Self::JobPanicked => 1203,

            Self::BatchDeadlineExceeded => 1300,
            Self::SubmissionClosed => 1301,

            Self::InvalidPipeline => 1400,
            Self::InvalidSchedule => 1401,
            Self::InvalidTimezone => 1402,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is transient.
    ///
    /// Nothing in the scheduler retries on its own; the next calendar firing
    /// is the retry. The flag is informational for callers and log readers.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LeaseBackendUnavailable
                | Self::LeaseBackendError
                | Self::StoreQueryFailed
                | Self::StoreInsertFailed
                | Self::JobTimeout
                | Self::BatchDeadlineExceeded
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "lease",
            1100..=1199 => "store",
            1200..=1299 => "job",
            1300..=1399 => "batch",
            1400..=1499 => "schedule",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input that only affects one firing or one job
    Low,
    /// Operational issues (timeouts, empty results)
    Medium,
    /// Backend or data failures
    High,
    /// The scheduler itself cannot run
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidPipeline
            | ErrorCode::InvalidLease
            | ErrorCode::SubmissionClosed => Self::Low,

            ErrorCode::AggregationEmpty
            | ErrorCode::JobTimeout
            | ErrorCode::BatchDeadlineExceeded => Self::Medium,

            ErrorCode::LeaseBackendError
            | ErrorCode::StoreQueryFailed
            | ErrorCode::StoreInsertFailed
            | ErrorCode::RowConversionFailed
            | ErrorCode::JobPanicked
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::High,

            ErrorCode::LeaseBackendUnavailable
            | ErrorCode::InvalidSchedule
            | ErrorCode::InvalidTimezone
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the rollup scheduler.
#[derive(Error, Debug)]
pub struct RollupError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short description of what went wrong
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RollupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RollupError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration validation error.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// Create a pipeline construction error.
    pub fn invalid_pipeline(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidPipeline, message)
    }

    /// The accumulator input queue is closed.
    pub fn submission_closed() -> Self {
        Self::new(
            ErrorCode::SubmissionClosed,
            "Job submission queue is closed",
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the short message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Rollup error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Rollup error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.user_message,
                    "Rollup error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "rollup_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RollupError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RollupError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RollupError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RollupError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for RollupError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (
                ErrorCode::LeaseBackendUnavailable,
                "Unable to connect to lease store",
            )
        } else if error.is_timeout() {
            (ErrorCode::LeaseBackendError, "Lease store operation timed out")
        } else {
            (ErrorCode::LeaseBackendError, "A lease store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RollupError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for RollupError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
