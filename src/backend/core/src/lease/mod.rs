//! Distributed leases for at-most-one execution across replicas.
//!
//! A lease is a time-bounded exclusive claim on a named resource. The
//! [`LeaseCoordinator`] wraps a remote key/TTL store ([`LeaseStore`]) and
//! gives callers a three-way answer: they now hold the lease, somebody else
//! holds it, or the store could not be asked.
//!
//! # Lifecycle
//!
//! ```text
//! Unclaimed ──try_acquire──▶ Held(owner) ──TTL expiry──▶ Unclaimed
//! ```
//!
//! There is no release operation. A lease returns to `Unclaimed` only when
//! its TTL runs out, so a replica that restarted cannot free a claim that
//! another process still relies on, and a finished rollup keeps racing
//! replicas out until the period is over.

pub mod backend;

pub use backend::{InMemoryLeaseStore, RedisLeaseStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, RollupError};
use crate::jobs::AggregationPeriod;
use crate::telemetry::LeaseMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Key
// ═══════════════════════════════════════════════════════════════════════════════

/// Name of a leased resource.
///
/// Rollup keys are derived only from the metric, the period and the bucket
/// format. Time ranges never appear in a key: two replicas racing the same
/// firing must compute the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseKey(String);

impl LeaseKey {
    /// Wrap an arbitrary key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for "this rollup, for this metric, at this granularity".
    pub fn for_rollup(metric: &str, period: AggregationPeriod) -> Self {
        Self(format!(
            "{}-{}-{}",
            metric,
            period.as_str(),
            period.bucket_format()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeaseKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Store
// ═══════════════════════════════════════════════════════════════════════════════

/// A key/value store with atomic "set if not present, with TTL" semantics.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Store `token` under `key` for `ttl` unless the key is already present.
    ///
    /// Returns `true` if the caller became the holder and `false` if the key
    /// was already held. Errors mean the store could not answer.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease
// ═══════════════════════════════════════════════════════════════════════════════

/// A held lease.
///
/// Dropping it does nothing: the claim stays in the store until `ttl` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: LeaseKey,
    token: String,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Token written to the store, unique per acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When the store will forget this claim.
    ///
    /// Saturates at the latest representable instant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Result of a lease acquisition attempt that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// The caller now holds the lease.
    Held(Lease),
    /// Another holder currently owns the lease. Not a failure.
    AlreadyHeld,
}

impl LeaseAcquisition {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held(_))
    }

    pub fn is_already_held(&self) -> bool {
        matches!(self, Self::AlreadyHeld)
    }

    /// The `(held, already_held)` pair.
    pub fn as_tuple(&self) -> (bool, bool) {
        (self.is_held(), self.is_already_held())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Provides at-most-one-holder semantics for named resources on top of a
/// [`LeaseStore`].
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    holder_id: String,
}

impl fmt::Debug for LeaseCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("store", &self.store.name())
            .field("holder_id", &self.holder_id)
            .finish()
    }
}

impl LeaseCoordinator {
    /// Create a coordinator that identifies itself as `holder_id`.
    pub fn new(store: Arc<dyn LeaseStore>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
        }
    }

    /// Create a coordinator with a random holder id.
    pub fn with_random_holder(store: Arc<dyn LeaseStore>) -> Self {
        Self::new(store, format!("replica-{}", Uuid::new_v4()))
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Try to become the holder of `key` for `ttl`.
    ///
    /// `Ok(AlreadyHeld)` is contention and must not be treated as a failure.
    /// `Err` means the backing store was unreachable or answered abnormally.
    pub async fn try_acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<LeaseAcquisition> {
        if ttl.is_zero() {
            return Err(RollupError::new(
                ErrorCode::InvalidLease,
                format!("lease TTL for {} must be greater than zero", key),
            ));
        }

        let token = format!("{}:{}", self.holder_id, Uuid::new_v4());

        match self.store.set_if_absent(key.as_str(), &token, ttl).await {
            Ok(true) => {
                LeaseMetrics::record("held");
                debug!(
                    lease_key = %key,
                    holder = %self.holder_id,
                    ttl_secs = ttl.as_secs(),
                    backend = self.store.name(),
                    "Lease acquired"
                );
                Ok(LeaseAcquisition::Held(Lease {
                    key: key.clone(),
                    token,
                    ttl,
                    acquired_at: Utc::now(),
                }))
            }
            Ok(false) => {
                LeaseMetrics::record("contended");
                info!(
                    lease_key = %key,
                    holder = %self.holder_id,
                    "Lease already held by another replica"
                );
                Ok(LeaseAcquisition::AlreadyHeld)
            }
            Err(e) => {
                LeaseMetrics::record("error");
                e.log();
                Err(e)
            }
        }
    }
}
