//! The concrete rollup job: optional lease check, aggregate, convert, insert.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::job::{Job, JobContext, JobError, JobOutcome, JobResult};
use super::pipeline::AggregatedReading;
use crate::lease::{LeaseAcquisition, LeaseCoordinator, LeaseKey};
use crate::store::{Document, DocumentStore, Pipeline};

/// Default budget for the aggregation and insert of one job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease a job must win before it does any work.
#[derive(Clone)]
pub struct LeaseCheck {
    pub key: LeaseKey,
    pub ttl: Duration,
    pub coordinator: Arc<LeaseCoordinator>,
}

impl LeaseCheck {
    pub fn new(key: LeaseKey, ttl: Duration, coordinator: Arc<LeaseCoordinator>) -> Self {
        Self { key, ttl, coordinator }
    }
}

impl fmt::Debug for LeaseCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCheck")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Runs an aggregation pipeline against a source store and inserts the
/// resulting rows into a target store.
///
/// Every row must deserialize as `T`. The row is re-serialized from `T`
/// before insertion, so the target only ever receives documents of that
/// shape.
pub struct AggregationJob<T = AggregatedReading> {
    name: String,
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    pipeline: Pipeline,
    lease_check: Option<LeaseCheck>,
    timeout: Duration,
    allow_empty: bool,
    _target: PhantomData<fn() -> T>,
}

impl AggregationJob<AggregatedReading> {
    /// Create a job producing [`AggregatedReading`] documents.
    pub fn new(
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            name: format!("aggregate:{}->{}", source.name(), target.name()),
            source,
            target,
            pipeline,
            lease_check: None,
            timeout: DEFAULT_JOB_TIMEOUT,
            allow_empty: false,
            _target: PhantomData,
        }
    }
}

impl<T> AggregationJob<T> {
    /// Produce documents of shape `U` instead.
    pub fn with_target_type<U>(self) -> AggregationJob<U> {
        AggregationJob {
            name: self.name,
            source: self.source,
            target: self.target,
            pipeline: self.pipeline,
            lease_check: self.lease_check,
            timeout: self.timeout,
            allow_empty: self.allow_empty,
            _target: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Skip the job unless `check` is won first.
    pub fn with_lease_check(mut self, check: LeaseCheck) -> Self {
        if self.name.starts_with("aggregate:") {
            self.name = format!("aggregate:{}", check.key);
        }
        self.lease_check = Some(check);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat an aggregation that returns no rows as a completed job that
    /// inserted nothing, instead of a failure.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn lease_key(&self) -> Option<&LeaseKey> {
        self.lease_check.as_ref().map(|check| &check.key)
    }
}

impl<T> fmt::Debug for AggregationJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationJob")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("target", &self.target.name())
            .field("stages", &self.pipeline.len())
            .field("lease_check", &self.lease_check)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl<T> Job for AggregationJob<T>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        if let Some(check) = &self.lease_check {
            match check.coordinator.try_acquire(&check.key, check.ttl).await {
                Ok(LeaseAcquisition::AlreadyHeld) => {
                    info!(
                        job = %self.name,
                        lease_key = %check.key,
                        "Rollup already claimed by another replica, skipping"
                    );
                    return Ok(JobOutcome::Skipped {
                        lease_key: check.key.clone(),
                    });
                }
                // The lease is left to expire on its own.
                Ok(LeaseAcquisition::Held(lease)) => {
                    debug!(
                        job = %self.name,
                        lease_key = %lease.key(),
                        expires_at = %lease.expires_at(),
                        "Rollup lease held"
                    );
                }
                Err(source) => {
                    return Err(JobError::LeaseBackend {
                        key: check.key.clone(),
                        source,
                    });
                }
            }
        }

        let deadline = Instant::now() + self.timeout;

        let rows = timeout_at(deadline, self.source.aggregate(&self.pipeline))
            .await
            .map_err(|_| JobError::Timeout(self.timeout))?
            .map_err(JobError::Aggregate)?;

        if rows.is_empty() {
            if self.allow_empty {
                debug!(job = %self.name, "Aggregation returned no rows");
                return Ok(JobOutcome::Completed { inserted: 0 });
            }
            return Err(JobError::EmptyAggregation);
        }

        let documents = convert_rows::<T>(rows)?;

        if ctx.is_cancelled() {
            return Err(JobError::Abandoned);
        }

        let inserted = timeout_at(deadline, self.target.insert_many(documents))
            .await
            .map_err(|_| JobError::Timeout(self.timeout))?
            .map_err(JobError::Insert)?;

        debug!(
            job = %self.name,
            worker = ctx.worker_id,
            batch = %ctx.batch_id,
            inserted,
            "Rollup inserted"
        );
        Ok(JobOutcome::Completed { inserted })
    }
}

/// Validate every row against `T` and normalize it to `T`'s serialized form.
fn convert_rows<T>(rows: Vec<Document>) -> Result<Vec<Document>, JobError>
where
    T: DeserializeOwned + Serialize,
{
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            let typed: T = serde_json::from_value(Value::Object(row))
                .map_err(|source| JobError::Conversion { index, source })?;
            let value = serde_json::to_value(&typed)
                .map_err(|source| JobError::Conversion { index, source })?;
            match value {
                Value::Object(document) => Ok(document),
                _ => Err(JobError::Conversion {
                    index,
                    source: <serde_json::Error as serde::de::Error>::custom(
                        "target type does not serialize to a document",
                    ),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::InMemoryLeaseStore;
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

    fn reading(sensor: &str) -> Document {
        match json!({
            "date": "2025-06-01T00:00:00Z",
            "metadata": { "sensor": sensor, "period": "DAILY", "dataType": "rain" },
            "totalValue": { "value": 4.2, "unit": "mm" },
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn stores(rows: Vec<Document>) -> (Arc<InMemoryDocumentStore>, Arc<InMemoryDocumentStore>) {
        (
            Arc::new(InMemoryDocumentStore::new("readings").with_rows(rows)),
            Arc::new(InMemoryDocumentStore::new("rollups")),
        )
    }

    #[tokio::test]
    async fn test_inserts_converted_rows() {
        let (source, target) = stores(vec![reading("a"), reading("b")]);
        let job = AggregationJob::new(source, target.clone(), Vec::new());

        let outcome = job.execute(&JobContext::detached()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { inserted: 2 });
        assert_eq!(target.inserted().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_aggregation_fails_by_default() {
        let (source, target) = stores(Vec::new());
        let job = AggregationJob::new(source.clone(), target.clone(), Vec::new());

        let err = job.execute(&JobContext::detached()).await.unwrap_err();
        assert!(matches!(err, JobError::EmptyAggregation));
        assert_eq!(target.insert_calls(), 0);

        let job = AggregationJob::new(source, target.clone(), Vec::new()).allow_empty(true);
        let outcome = job.execute(&JobContext::detached()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { inserted: 0 });
        assert_eq!(target.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_conversion_failure_reports_row_and_inserts_nothing() {
        let mut bad = reading("c");
        bad.remove("totalValue");
        let (source, target) = stores(vec![reading("a"), bad]);
        let job = AggregationJob::new(source, target.clone(), Vec::new());

        let err = job.execute(&JobContext::detached()).await.unwrap_err();
        assert!(matches!(err, JobError::Conversion { index: 1, .. }));
        assert!(target.inserted().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_and_insert_errors_propagate() {
        let (source, target) = stores(vec![reading("a")]);
        source.fail_aggregate(true);
        let job = AggregationJob::new(source.clone(), target.clone(), Vec::new());
        assert!(matches!(
            job.execute(&JobContext::detached()).await,
            Err(JobError::Aggregate(_))
        ));

        source.fail_aggregate(false);
        target.fail_insert(true);
        assert!(matches!(
            job.execute(&JobContext::detached()).await,
            Err(JobError::Insert(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_aggregation_times_out() {
        let source = Arc::new(
            InMemoryDocumentStore::new("readings")
                .with_rows(vec![reading("a")])
                .with_aggregate_delay(Duration::from_secs(60)),
        );
        let target = Arc::new(InMemoryDocumentStore::new("rollups"));
        let job = AggregationJob::new(source, target.clone(), Vec::new())
            .with_timeout(Duration::from_secs(10));

        let err = job.execute(&JobContext::detached()).await.unwrap_err();
        assert!(matches!(err, JobError::Timeout(t) if t == Duration::from_secs(10)));
        assert!(target.inserted().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_does_not_insert() {
        let (source, target) = stores(vec![reading("a")]);
        let job = AggregationJob::new(source, target.clone(), Vec::new());
        let ctx = JobContext::detached();
        ctx.cancellation.cancel();

        assert!(matches!(job.execute(&ctx).await, Err(JobError::Abandoned)));
        assert_eq!(target.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_lease_contention_skips_without_touching_stores() {
        let leases = Arc::new(InMemoryLeaseStore::new());
        let key = LeaseKey::new("rain-DAILY-%Y-%m-%d");
        let ttl = Duration::from_secs(60);
        let (source, target) = stores(vec![reading("a")]);

        let coordinator_a = Arc::new(LeaseCoordinator::new(leases.clone(), "a"));
        let coordinator_b = Arc::new(LeaseCoordinator::new(leases, "b"));
        let winner = AggregationJob::new(source.clone(), target.clone(), Vec::new())
            .with_lease_check(LeaseCheck::new(key.clone(), ttl, coordinator_a));
        let loser = AggregationJob::new(source.clone(), target.clone(), Vec::new())
            .with_lease_check(LeaseCheck::new(key.clone(), ttl, coordinator_b));
        assert_eq!(winner.name(), "aggregate:rain-DAILY-%Y-%m-%d");

        assert!(winner.execute(&JobContext::detached()).await.is_ok());
        let outcome = loser.execute(&JobContext::detached()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { lease_key: key });
        assert_eq!(source.pipelines().len(), 1);
        assert_eq!(target.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_target_type() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct SensorOnly {
            metadata: serde_json::Map<String, Value>,
        }

        let (source, target) = stores(vec![reading("a")]);
        let job = AggregationJob::new(source, target.clone(), Vec::new())
            .with_target_type::<SensorOnly>();
        job.execute(&JobContext::detached()).await.unwrap();

        let inserted = target.inserted();
        assert_eq!(inserted.len(), 1);
        assert!(!inserted[0].contains_key("totalValue"));
    }
}
