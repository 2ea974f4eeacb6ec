//! Document store backends
//!
//! - **MongoStore**: MongoDB through the official driver
//! - **MemoryStore**: in-process store for single-node runs and tests
//!
//! Both are reached through [`DocumentStore`] and shared by pool name via
//! [`PoolRegistry`].

pub mod memory;
pub mod mongo;
pub mod pool;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::types::Result;

pub use memory::MemoryStore;
pub use mongo::{MongoConfig, MongoStore};
pub use pool::PoolRegistry;

/// Options applied to a find
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    /// Inclusive projection; `None` returns all fields
    pub projection: Option<Document>,
    /// Sort document; `None` keeps store order
    pub sort: Option<Document>,
    /// Maximum number of documents; `None` is unbounded
    pub limit: Option<i64>,
    /// Number of documents to skip
    pub skip: u64,
}

/// Result of an upsert
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// A new document was written with this id
    Inserted(Bson),
    /// The document with this id was replaced
    Updated(Bson),
}

impl SaveOutcome {
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Operations the gateway needs from a document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert, or replace the document whose `_id` matches
    async fn save(&self, collection: &str, document: Document) -> Result<SaveOutcome>;

    /// Find documents matching `filter`
    async fn find(&self, collection: &str, filter: Document, spec: FindSpec)
        -> Result<Vec<Document>>;

    /// Run an aggregation and return the raw command reply (`cursor.firstBatch`)
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Document>;

    /// Release the underlying connection
    async fn close(&self) -> Result<()>;
}
