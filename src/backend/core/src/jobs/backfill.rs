//! Historical backfill: roll up a past time range without lease checks.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::aggregation::{AggregationJob, DEFAULT_JOB_TIMEOUT};
use super::pipeline::RollupPipeline;
use super::queue::JobSubmitter;
use super::AggregationPeriod;
use crate::error::Result;
use crate::store::DocumentStore;

/// One backfill run over `[from, until)`.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub metric: String,
    pub periods: Vec<AggregationPeriod>,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub timezone: Option<Tz>,
    pub job_timeout: Duration,
}

impl BackfillRequest {
    /// Daily, weekly, monthly and yearly rollups of `metric` over `[from, until)`.
    pub fn new(metric: impl Into<String>, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            periods: vec![
                AggregationPeriod::Daily,
                AggregationPeriod::Weekly,
                AggregationPeriod::Monthly,
                AggregationPeriod::Yearly,
            ],
            from,
            until,
            timezone: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_periods(mut self, periods: Vec<AggregationPeriod>) -> Self {
        self.periods = periods;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Submit one rollup job per requested period covering the whole range.
///
/// Backfill jobs carry no lease check, so running a backfill on several
/// replicas at once duplicates its output. All pipelines are built before
/// anything is submitted; an invalid request submits nothing.
pub async fn backfill(
    request: &BackfillRequest,
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    submitter: &JobSubmitter,
) -> Result<usize> {
    let mut jobs = Vec::with_capacity(request.periods.len());
    for &period in &request.periods {
        let mut pipeline =
            RollupPipeline::new(&request.metric, period, request.from, request.until);
        if let Some(tz) = request.timezone {
            pipeline = pipeline.with_timezone(tz);
        }

        let job = AggregationJob::new(source.clone(), target.clone(), pipeline.build()?)
            .with_name(format!("backfill:{}-{}", request.metric, period))
            .with_timeout(request.job_timeout);
        jobs.push(job);
    }

    let count = jobs.len();
    for job in jobs {
        submitter.submit(Box::new(job)).await?;
    }

    info!(
        metric = %request.metric,
        from = %request.from,
        until = %request.until,
        jobs = count,
        "Backfill submitted"
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::queue::job_queue;
    use crate::store::InMemoryDocumentStore;
    use chrono::TimeZone;

    fn stores() -> (Arc<dyn DocumentStore>, Arc<dyn DocumentStore>) {
        (
            Arc::new(InMemoryDocumentStore::new("readings")),
            Arc::new(InMemoryDocumentStore::new("rollups")),
        )
    }

    #[tokio::test]
    async fn test_submits_one_job_per_period() {
        let (source, target) = stores();
        let (submitter, _rx) = job_queue(16);
        let request = BackfillRequest::new(
            "rainfallHourly",
            Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        );

        assert_eq!(backfill(&request, source, target, &submitter).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_invalid_range_submits_nothing() {
        let (source, target) = stores();
        let (submitter, mut rx) = job_queue(16);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let request = BackfillRequest::new("rain", now, now);

        let err = backfill(&request, source, target, &submitter).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPipeline);
        drop(submitter);
        assert!(rx.recv().await.is_none());
    }
}
