//! Document store abstraction.
//!
//! The scheduler reads raw readings through an aggregation pipeline and
//! writes rolled-up documents back with a bulk insert. Concrete adapters for a
//! document database live outside this crate; [`InMemoryDocumentStore`]
//! stands in for one in tests and local runs.

pub mod memory;

pub use memory::InMemoryDocumentStore;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// A schemaless document.
pub type Document = Map<String, Value>;

/// An ordered list of aggregation stages, each a single-key document such as
/// `{"$match": {...}}`.
pub type Pipeline = Vec<Document>;

/// A collection that can run aggregation pipelines and accept bulk inserts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Collection name for logging.
    fn name(&self) -> &str;

    /// Run `pipeline` and return the resulting rows.
    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>>;

    /// Insert `documents`, returning how many were written.
    async fn insert_many(&self, documents: Vec<Document>) -> Result<usize>;
}
