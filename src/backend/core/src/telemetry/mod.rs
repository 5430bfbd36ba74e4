//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: JSON/pretty/compact logging via `tracing-subscriber`
//! - **Metrics**: counter names and descriptions recorded via the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_core::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, BatchMetrics, JobMetrics, LeaseMetrics};

/// Initialize logging and register metric descriptions.
///
/// # Errors
///
/// Returns an error if the logging subscriber cannot be installed.
pub fn init_telemetry(config: &LoggingConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    describe_metrics();
    tracing::debug!("Telemetry initialized");
    Ok(())
}
