//! Job definitions and traits.
//!
//! This module provides the core abstractions every unit of work shares:
//!
//! - **Job trait**: The interface the worker pool executes
//! - **JobContext**: Context passed to jobs during execution
//! - **JobOutcome / JobError**: What a job reports back to its batch

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, RollupError};
use crate::lease::LeaseKey;

// ═══════════════════════════════════════════════════════════════════════════════
// Batch Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for one flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Index of the worker running the job
    pub worker_id: usize,
    /// Batch the job was flushed in
    pub batch_id: BatchId,
    /// Cancelled once the batch deadline passes
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(worker_id: usize, batch_id: BatchId, cancellation: CancellationToken) -> Self {
        Self {
            worker_id,
            batch_id,
            cancellation,
        }
    }

    /// A context outside any batch, for running a job directly.
    pub fn detached() -> Self {
        Self::new(0, BatchId::new(), CancellationToken::new())
    }

    /// Whether the batch has given up on this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Successful job outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job ran to completion and wrote `inserted` documents.
    Completed { inserted: usize },
    /// Another replica holds the lease; nothing was done.
    Skipped { lease_key: LeaseKey },
}

impl JobOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a job failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("lease store unavailable for {key}: {source}")]
    LeaseBackend {
        key: LeaseKey,
        #[source]
        source: RollupError,
    },

    #[error("aggregation query failed: {0}")]
    Aggregate(#[source] RollupError),

    #[error("aggregation produced no rows")]
    EmptyAggregation,

    #[error("row {index} does not match the target document shape: {source}")]
    Conversion {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("bulk insert failed: {0}")]
    Insert(#[source] RollupError),

    #[error("job exceeded its {0:?} timeout")]
    Timeout(Duration),

    #[error("batch deadline passed before the job finished")]
    Abandoned,

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Crate error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LeaseBackend { source, .. } => source.code(),
            Self::Aggregate(_) => ErrorCode::StoreQueryFailed,
            Self::EmptyAggregation => ErrorCode::AggregationEmpty,
            Self::Conversion { .. } => ErrorCode::RowConversionFailed,
            Self::Insert(_) => ErrorCode::StoreInsertFailed,
            Self::Timeout(_) => ErrorCode::JobTimeout,
            Self::Abandoned => ErrorCode::BatchDeadlineExceeded,
            Self::Panicked(_) => ErrorCode::JobPanicked,
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<JobOutcome, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The main trait for schedulable work.
///
/// A job runs at most once. Implementations must not panic on ordinary
/// failures; return a [`JobError`] instead. A panic is caught by the worker
/// and reported as [`JobError::Panicked`].
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    /// Name used in logs and batch reports.
    fn name(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

/// A type-erased job, as carried through the submission queue.
pub type BoxedJob = Box<dyn Job>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(JobError::EmptyAggregation.code(), ErrorCode::AggregationEmpty);
        assert_eq!(JobError::Timeout(Duration::from_secs(1)).code(), ErrorCode::JobTimeout);
        assert_eq!(JobError::Abandoned.code(), ErrorCode::BatchDeadlineExceeded);

        let backend = JobError::LeaseBackend {
            key: LeaseKey::new("k"),
            source: RollupError::new(ErrorCode::LeaseBackendUnavailable, "down"),
        };
        assert_eq!(backend.code(), ErrorCode::LeaseBackendUnavailable);
        assert!(backend.to_string().contains("k"));
    }

    #[test]
    fn test_detached_context_is_live() {
        let ctx = JobContext::detached();
        assert!(!ctx.is_cancelled());
        ctx.cancellation.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_outcome_skipped() {
        assert!(JobOutcome::Skipped { lease_key: LeaseKey::new("k") }.is_skipped());
        assert!(!JobOutcome::Completed { inserted: 3 }.is_skipped());
    }
}
