//! Tests for distributed lease coordination.
//!
//! Tests cover:
//! - At most one holder under concurrent contention
//! - Lease TTLs relative to period lengths
//! - Replicas racing the same rollup
//! - Backend failures surfacing as job failures

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rollup_core::error::{ErrorCode, Result, RollupError};
use rollup_core::jobs::{
    AggregationJob, AggregationPeriod, Job, JobContext, JobError, JobOutcome, LeaseCheck,
    RollupPipeline,
};
use rollup_core::lease::{InMemoryLeaseStore, LeaseCoordinator, LeaseKey, LeaseStore};
use rollup_core::store::{Document, InMemoryDocumentStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Utilities
// ============================================================================

fn reading(sensor: &str) -> Document {
    match json!({
        "date": "2025-06-01T00:00:00Z",
        "metadata": { "sensor": sensor, "period": "DAILY", "dataType": "rain" },
        "totalValue": { "value": 1.5, "unit": "mm" },
    }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

struct UnreachableStore;

#[async_trait]
impl LeaseStore for UnreachableStore {
    async fn set_if_absent(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
        Err(RollupError::new(
            ErrorCode::LeaseBackendUnavailable,
            "Unable to connect to lease store",
        ))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

// ============================================================================
// At-Most-One Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_single_winner() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let key = LeaseKey::for_rollup("rainfallHourly", AggregationPeriod::Daily);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = LeaseCoordinator::new(store.clone(), format!("replica-{}", i));
            let key = key.clone();
            tokio::spawn(async move {
                coordinator.try_acquire(&key, Duration::from_secs(60)).await
            })
        })
        .collect();

    let mut held = 0;
    let mut contended = 0;
    for handle in handles {
        let acquisition = handle.await.unwrap().unwrap();
        if acquisition.is_held() {
            held += 1;
        } else {
            contended += 1;
        }
    }

    assert_eq!(held, 1);
    assert_eq!(contended, 15);
}

#[tokio::test(start_paused = true)]
async fn test_lease_becomes_available_after_ttl() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let a = LeaseCoordinator::new(store.clone(), "a");
    let b = LeaseCoordinator::new(store.clone(), "b");
    let key = LeaseKey::new("rain-HOURLY-%Y-%m-%d-%H");
    let ttl = AggregationPeriod::Hourly.lease_ttl();

    assert!(a.try_acquire(&key, ttl).await.unwrap().is_held());

    tokio::time::advance(ttl - Duration::from_secs(1)).await;
    assert!(b.try_acquire(&key, ttl).await.unwrap().is_already_held());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(b.try_acquire(&key, ttl).await.unwrap().is_held());
}

// ============================================================================
// TTL Tests
// ============================================================================

#[test]
fn test_lease_ttl_shorter_than_every_period() {
    for period in AggregationPeriod::ALL {
        assert_eq!(period.lease_ttl() + Duration::from_secs(60), period.min_duration());
    }
    assert_eq!(AggregationPeriod::Weekly.lease_ttl(), Duration::from_secs(7 * 86400 - 60));
    assert_eq!(AggregationPeriod::Monthly.lease_ttl(), Duration::from_secs(28 * 86400 - 60));
}

#[test]
fn test_keys_do_not_depend_on_time_range() {
    let key = LeaseKey::for_rollup("rain", AggregationPeriod::Monthly);
    assert_eq!(key.as_str(), "rain-MONTHLY-%Y-%m-01");
    assert!(!key.as_str().contains("2025"));
}

// ============================================================================
// Replica Race Tests
// ============================================================================

#[tokio::test]
async fn test_second_replica_skips_daily_rollup() {
    let leases = Arc::new(InMemoryLeaseStore::new());
    let until = Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap();
    let from = Utc.with_ymd_and_hms(2025, 5, 31, 16, 0, 0).unwrap();
    let key = LeaseKey::for_rollup("rain", AggregationPeriod::Daily);
    let ttl = AggregationPeriod::Daily.lease_ttl();
    assert_eq!(ttl, Duration::from_secs(23 * 3600 + 59 * 60));

    let build = |holder: &str, target: Arc<InMemoryDocumentStore>| {
        let source =
            Arc::new(InMemoryDocumentStore::new("readings").with_rows(vec![reading("s-1")]));
        let pipeline = RollupPipeline::new("rain", AggregationPeriod::Daily, from, until)
            .build()
            .unwrap();
        AggregationJob::new(source, target, pipeline).with_lease_check(LeaseCheck::new(
            key.clone(),
            ttl,
            Arc::new(LeaseCoordinator::new(leases.clone(), holder)),
        ))
    };

    let target_a = Arc::new(InMemoryDocumentStore::new("rollups-a"));
    let target_b = Arc::new(InMemoryDocumentStore::new("rollups-b"));
    let job_a = build("replica-a", target_a.clone());
    let job_b = build("replica-b", target_b.clone());

    let outcome_a = job_a.execute(&JobContext::detached()).await.unwrap();
    let outcome_b = job_b.execute(&JobContext::detached()).await.unwrap();

    assert_eq!(outcome_a, JobOutcome::Completed { inserted: 1 });
    assert_eq!(outcome_b, JobOutcome::Skipped { lease_key: key });
    assert_eq!(target_a.inserted().len(), 1);
    assert_eq!(target_b.insert_calls(), 0);
    assert_eq!(leases.remaining_ttl("rain-DAILY-%Y-%m-%d").map(|t| t <= ttl), Some(true));
}

// ============================================================================
// Backend Failure Tests
// ============================================================================

#[tokio::test]
async fn test_unreachable_lease_store_fails_job() {
    let coordinator = Arc::new(LeaseCoordinator::new(Arc::new(UnreachableStore), "a"));
    let source = Arc::new(InMemoryDocumentStore::new("readings").with_rows(vec![reading("s-1")]));
    let target = Arc::new(InMemoryDocumentStore::new("rollups"));
    let job = AggregationJob::new(source.clone(), target.clone(), Vec::new()).with_lease_check(
        LeaseCheck::new(LeaseKey::new("k"), Duration::from_secs(60), coordinator.clone()),
    );

    let err = job.execute(&JobContext::detached()).await.unwrap_err();
    assert!(matches!(err, JobError::LeaseBackend { .. }));
    assert_eq!(err.code(), ErrorCode::LeaseBackendUnavailable);
    assert!(source.pipelines().is_empty());
    assert_eq!(target.insert_calls(), 0);

    let direct = coordinator
        .try_acquire(&LeaseKey::new("k"), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(direct.is_retryable());
}
