//! Lease store implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::LeaseStore;
use crate::config::RedisConfig;
use crate::error::{ErrorCode, Result, RollupError};

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    expires_at: Instant,
}

/// Process-local lease store.
///
/// Replicas sharing one instance (through an `Arc`) contend exactly like
/// replicas sharing a Redis server. Expiry follows the tokio clock, so tests
/// running with paused time can step over a TTL.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the current holder of `key`, if the lease is live.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.token.clone())
    }

    /// Time left before `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.expires_at - now)
    }

    /// Number of live leases. Expired entries are purged as a side effect.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            LeaseEntry {
                token: token.to_string(),
                expires_at: now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE),
            },
        );
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed lease store using `SET key token NX PX ttl`.
pub struct RedisLeaseStore {
    connection: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisLeaseStore {
    /// Connect to Redis and verify the server answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            RollupError::with_internal(
                ErrorCode::LeaseBackendUnavailable,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut connection = tokio::time::timeout(
            config.connect_timeout,
            redis::aio::ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            RollupError::new(
                ErrorCode::LeaseBackendUnavailable,
                format!("Timed out connecting to Redis at {}", config.url),
            )
        })?
        .map_err(|e| {
            RollupError::with_internal(
                ErrorCode::LeaseBackendUnavailable,
                "Failed to connect to Redis",
                e.to_string(),
            )
        })?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| {
                RollupError::with_internal(
                    ErrorCode::LeaseBackendUnavailable,
                    "Redis ping failed",
                    e.to_string(),
                )
            })?;

        info!("Redis lease store connected to {}", config.url);

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        // Redis answers OK on success and nil when NX refused the write.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(RollupError::from)?;

        Ok(reply.is_some())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_after_ttl() {
        let store = InMemoryLeaseStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.holder("k").is_none());
        assert!(store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_len_purges_expired() {
        let store = InMemoryLeaseStore::new();
        store.set_if_absent("short", "a", Duration::from_secs(1)).await.unwrap();
        store.set_if_absent("long", "a", Duration::from_secs(100)).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.remaining_ttl("long"), Some(Duration::from_secs(98)));
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_contend() {
        let store = InMemoryLeaseStore::new();
        assert!(store.set_if_absent("a", "t", Duration::from_secs(5)).await.unwrap());
        assert!(store.set_if_absent("b", "t", Duration::from_secs(5)).await.unwrap());
    }
}
