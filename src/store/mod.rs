//! Narrow interface to the document store holding the listings collection.
//!
//! Connection management, wire protocol and transport retries belong to the
//! adapter. The core only finds, aggregates, watches and writes through this
//! trait.

pub mod memory;

use async_trait::async_trait;
use bson::Document;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::query::{Filter, FindOptions};

pub use memory::InMemoryStore;

/// Failures reported by a store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The resume marker fell out of the store's change retention.
    #[error("resume point lost: {0}")]
    ResumePointLost(String),

    #[error("start time out of range: {0}")]
    StartTimeOutOfRange(String),

    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Lazily pulled result documents. Per-item errors do not end the stream.
pub type DocumentCursor = BoxStream<'static, Result<Document, StoreError>>;

/// Raw change notifications, in the store's total order for the collection.
pub type ChangeCursor = BoxStream<'static, Result<Document, StoreError>>;

/// Where a watch starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only changes made after the watch opens.
    #[default]
    Now,
    /// Changes strictly after the notification carrying this marker.
    ResumeAfter(String),
    /// Changes at or after this cluster time.
    AtOperationTime(bson::Timestamp),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub start: StartPosition,
    /// Attach the post-image of the document to update notifications.
    pub full_document: bool,
}

/// Outcome of `find_one_and_update`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(Document),
    NotMatched,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents matching the conjunction `clauses`.
    async fn find(&self, clauses: &[Filter], opts: &FindOptions) -> Result<DocumentCursor, StoreError>;

    /// Runs a search pipeline (`$search`, `$limit`, `$skip` stages).
    async fn aggregate(&self, stages: &[Document]) -> Result<DocumentCursor, StoreError>;

    /// Opens a change stream restricted by `clauses`, evaluated against the
    /// raw notification (paths like `operationType` or `fullDocument.<field>`).
    async fn watch(&self, clauses: &[Filter], opts: &WatchOptions) -> Result<ChangeCursor, StoreError>;

    async fn find_one(&self, clauses: &[Filter], opts: &FindOptions) -> Result<Option<Document>, StoreError>;

    /// Inserts `doc`; fails with `DuplicateKey` when its `_id` is taken.
    async fn insert_one(&self, doc: Document) -> Result<(), StoreError>;

    /// Applies a `{"$set": {...}}` update to the first match and returns the
    /// document after the update.
    async fn find_one_and_update(&self, clauses: &[Filter], update: Document) -> Result<UpdateOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
