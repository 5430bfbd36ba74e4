#![allow(clippy::result_large_err)]
//! # Rollup Core
//!
//! Periodic rollup scheduling for time-series sensor data.
//!
//! ## Architecture
//!
//! - **Jobs**: Calendar triggers, batch windowing and a bounded worker pool
//!   that run aggregation pipelines and write rolled-up documents
//! - **Lease**: At-most-one execution of each rollup across replicas, backed
//!   by Redis
//! - **Store**: The document store seam aggregation jobs read and write through
//! - **Telemetry**: Structured logging and metrics
//! - **Config**: File and environment configuration

pub mod config;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, RollupError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, RedisConfig, SchedulerConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, Result, RollupError};
    pub use crate::jobs::{
        backfill, job_queue, AccumulatorExit, AggregatedReading, AggregationJob,
        AggregationPeriod, BackfillRequest, BatchAccumulator, BatchConfig, BatchReport, BoxedJob,
        CronTrigger, Job, JobContext, JobError, JobOutcome, JobResult, JobSubmitter, LeaseCheck,
        RollupPipeline, RollupTargets, TriggerConfig, WorkerPool, WorkerPoolConfig,
    };
    pub use crate::lease::{
        InMemoryLeaseStore, Lease, LeaseAcquisition, LeaseCoordinator, LeaseKey, LeaseStore,
        RedisLeaseStore,
    };
    pub use crate::runtime::{RollupHandle, RollupRuntime};
    pub use crate::store::{Document, DocumentStore, InMemoryDocumentStore, Pipeline};
    pub use crate::telemetry::{init_telemetry, LogFormat, LoggingConfig};
}
