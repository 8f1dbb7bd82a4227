//! Backing-store contract.
//!
//! The access layer only ever talks to a store through [`Connector`] (to open
//! a bucket) and [`Bucket`] (single-key document operations plus view range
//! scans). Network protocol, clustering and authentication live behind these
//! traits.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::config::Config;
use crate::query::ViewQuery;
use crate::types::Document;

/// Failures reported by a backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key '{0}' not found")]
    KeyNotFound(String),

    #[error("Key '{0}' already exists")]
    KeyExists(String),

    /// The operation did not complete in time. Callers drop their connection.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}

/// A convenience type alias for `Result<T, StoreError>`.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One row of a view scan: the index key and the document id it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub key: String,
    pub id: String,
}

/// How up to date a view must be before it is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Staleness {
    /// Serve whatever the index holds.
    Ok,
    /// Serve the current index, then bring it up to date.
    UpdateAfter,
    /// Bring the index up to date, then serve it.
    #[default]
    UpdateBefore,
}

/// Opens buckets. Implementations decide how hosts, ports and credentials are
/// used; the client only calls `connect` when it holds no live bucket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Bucket: Bucket;

    async fn connect(&self, config: &Config) -> StoreResult<Arc<Self::Bucket>>;
}

/// An open bucket.
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    /// Creates a document. Fails with `KeyExists` if `id` is taken.
    async fn put(&self, id: &str, document: &Document) -> StoreResult<()>;

    async fn get_one(&self, id: &str) -> StoreResult<Document>;

    async fn delete_one(&self, id: &str) -> StoreResult<()>;

    /// Scans a view. Rows come back in the requested order with skip and
    /// limit already applied.
    async fn range_scan(&self, query: &ViewQuery) -> StoreResult<Vec<IndexRow>>;

    /// Fetches many documents concurrently. Ids that do not exist are left
    /// out of the result; any other failure fails the whole batch.
    async fn get_many(&self, ids: &[String]) -> StoreResult<BTreeMap<String, Document>> {
        let fetches = ids.iter().map(|id| async move {
            match self.get_one(id).await {
                Ok(document) => Ok(Some((id.clone(), document))),
                Err(e) if e.is_not_found() => {
                    trace!(%id, "Document vanished before fetch, skipping");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        });
        let mut documents = BTreeMap::new();
        for fetched in join_all(fetches).await {
            if let Some((id, document)) = fetched? {
                documents.insert(id, document);
            }
        }
        Ok(documents)
    }
}
