//! In-memory document store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{Document, DocumentStore, Pipeline};
use crate::error::{ErrorCode, Result, RollupError};

/// Document store held in process memory.
///
/// `aggregate` does not interpret the pipeline: it records it and returns the
/// rows seeded with [`with_rows`](Self::with_rows). Inserted documents are
/// kept for inspection. Either operation can be made to fail or stall.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    name: String,
    rows: RwLock<Vec<Document>>,
    inserted: RwLock<Vec<Document>>,
    pipelines: RwLock<Vec<Pipeline>>,
    aggregate_delay: RwLock<Option<Duration>>,
    fail_aggregate: AtomicBool,
    fail_insert: AtomicBool,
    insert_calls: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Rows returned by every `aggregate` call.
    pub fn with_rows(self, rows: Vec<Document>) -> Self {
        *self.rows.write() = rows;
        self
    }

    /// Make `aggregate` sleep before answering.
    pub fn with_aggregate_delay(self, delay: Duration) -> Self {
        *self.aggregate_delay.write() = Some(delay);
        self
    }

    pub fn fail_aggregate(&self, fail: bool) {
        self.fail_aggregate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    /// Every document inserted so far.
    pub fn inserted(&self) -> Vec<Document> {
        self.inserted.read().clone()
    }

    /// Number of `insert_many` calls that reached the store.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Every pipeline passed to `aggregate`, oldest first.
    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.pipelines.read().clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>> {
        self.pipelines.write().push(pipeline.clone());

        let delay = *self.aggregate_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_aggregate.load(Ordering::SeqCst) {
            return Err(RollupError::new(
                ErrorCode::StoreQueryFailed,
                format!("aggregation on {} failed", self.name),
            ));
        }

        Ok(self.rows.read().clone())
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<usize> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(RollupError::new(
                ErrorCode::StoreInsertFailed,
                format!("insert into {} failed", self.name),
            ));
        }

        let count = documents.len();
        self.inserted.write().extend(documents);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_aggregate_returns_seeded_rows_and_records_pipeline() {
        let store = InMemoryDocumentStore::new("readings").with_rows(vec![doc(json!({"a": 1}))]);
        let pipeline = vec![doc(json!({"$match": {}}))];

        let rows = store.aggregate(&pipeline).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.pipelines(), vec![pipeline]);
    }

    #[tokio::test]
    async fn test_insert_failure_is_reported() {
        let store = InMemoryDocumentStore::new("rollups");
        store.fail_insert(true);

        let err = store.insert_many(vec![doc(json!({"a": 1}))]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreInsertFailed);
        assert!(store.inserted().is_empty());
        assert_eq!(store.insert_calls(), 1);
    }
}
