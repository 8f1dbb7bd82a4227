//! In-process store implementing the backing-store contract.
//!
//! Keeps documents in a `BTreeMap` and maintains the `logicalKey|timestamp`
//! view the way a document database would: view updates are queued on write
//! and only folded into the index when a scan asks for it (see
//! [`Staleness`]). Faults can be injected per operation, which is how the
//! reconnect-on-timeout behavior of the client is exercised.

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::codec;
use crate::config::{Config, ViewConfig};
use crate::query::ViewQuery;
use crate::store::{Bucket, Connector, IndexRow, Staleness, StoreError, StoreResult};
use crate::types::{Document, SortOrder};

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Put,
    Get,
    Delete,
    Scan,
}

/// Kind of failure an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Connection,
    Backend,
}

impl FaultKind {
    fn into_error(self, op: Operation) -> StoreError {
        match self {
            FaultKind::Timeout => StoreError::Timeout(format!("injected timeout on {:?}", op)),
            FaultKind::Connection => {
                StoreError::Connection(format!("injected connection failure on {:?}", op))
            }
            FaultKind::Backend => StoreError::Backend(anyhow!("injected failure on {:?}", op)),
        }
    }
}

/// Operation counters, for asserting what reached the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub connects: usize,
    pub puts: usize,
    pub gets: usize,
    pub deletes: usize,
    pub scans: usize,
}

#[derive(Debug)]
enum IndexChange {
    Add { key: String, id: String },
    Remove { key: String },
}

#[derive(Debug, Default)]
struct BucketState {
    documents: BTreeMap<String, Document>,
    index: BTreeMap<String, String>,
    pending: Vec<IndexChange>,
}

impl BucketState {
    fn refresh_index(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        trace!(changes = self.pending.len(), "Refreshing view index");
        for change in self.pending.drain(..) {
            match change {
                IndexChange::Add { key, id } => {
                    self.index.insert(key, id);
                }
                IndexChange::Remove { key } => {
                    self.index.remove(&key);
                }
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    puts: AtomicUsize,
    gets: AtomicUsize,
    deletes: AtomicUsize,
    scans: AtomicUsize,
}

struct Inner {
    state: RwLock<BucketState>,
    faults: Mutex<VecDeque<(Operation, FaultKind)>>,
    counters: Counters,
    view: ViewConfig,
    password: Option<String>,
    connect_delay: Option<Duration>,
}

/// Shared handle to one in-memory bucket. Clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configures a [`MemoryStore`].
#[derive(Default)]
pub struct MemoryStoreBuilder {
    view: ViewConfig,
    password: Option<String>,
    connect_delay: Option<Duration>,
}

impl MemoryStoreBuilder {
    /// View the store answers scans for. Defaults to `search/search`.
    pub fn view(mut self, view: ViewConfig) -> Self {
        self.view = view;
        self
    }

    /// Require this password on connect.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Make every connect take this long.
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore {
            inner: Arc::new(Inner {
                state: RwLock::new(BucketState::default()),
                faults: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
                view: self.view,
                password: self.password,
                connect_delay: self.connect_delay,
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Makes the next `op` fail with `kind`. Faults queue up in call order.
    pub fn fail_next(&self, op: Operation, kind: FaultKind) {
        self.inner.faults.lock().push_back((op, kind));
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let c = &self.inner.counters;
        MemoryStoreStats {
            connects: c.connects.load(Ordering::SeqCst),
            puts: c.puts.load(Ordering::SeqCst),
            gets: c.gets.load(Ordering::SeqCst),
            deletes: c.deletes.load(Ordering::SeqCst),
            scans: c.scans.load(Ordering::SeqCst),
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.inner.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View updates written but not yet folded into the index.
    pub fn pending_index_changes(&self) -> usize {
        self.inner.state.read().pending.len()
    }

    fn check_fault(&self, op: Operation) -> StoreResult<()> {
        let mut faults = self.inner.faults.lock();
        if let Some(pos) = faults.iter().position(|(o, _)| *o == op) {
            if let Some((_, kind)) = faults.remove(pos) {
                debug!(?op, ?kind, "Injecting store fault");
                return Err(kind.into_error(op));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Bucket = MemoryBucket;

    async fn connect(&self, config: &Config) -> StoreResult<Arc<MemoryBucket>> {
        self.inner.counters.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.inner.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_fault(Operation::Connect)?;
        if self.inner.password.is_some() && self.inner.password != config.password {
            return Err(StoreError::Connection(format!(
                "authentication failed for bucket '{}'",
                config.bucket
            )));
        }
        info!(
            hosts = %config.connection_string(),
            bucket = %config.bucket,
            "Opened in-memory bucket"
        );
        Ok(Arc::new(MemoryBucket {
            store: self.clone(),
        }))
    }
}

/// An open handle on a [`MemoryStore`].
pub struct MemoryBucket {
    store: MemoryStore,
}

impl MemoryBucket {
    fn inner(&self) -> &Inner {
        &self.store.inner
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn put(&self, id: &str, document: &Document) -> StoreResult<()> {
        self.inner().counters.puts.fetch_add(1, Ordering::SeqCst);
        self.store.check_fault(Operation::Put)?;
        let mut state = self.inner().state.write();
        if state.documents.contains_key(id) {
            return Err(StoreError::KeyExists(id.to_string()));
        }
        state.documents.insert(id.to_string(), document.clone());
        // Only ids the view's map function understands get an index row.
        if let Ok((timestamp, logical_key)) = codec::decode(id) {
            state.pending.push(IndexChange::Add {
                key: codec::index_key(logical_key, timestamp),
                id: id.to_string(),
            });
        }
        trace!(%id, "Stored document");
        Ok(())
    }

    async fn get_one(&self, id: &str) -> StoreResult<Document> {
        self.inner().counters.gets.fetch_add(1, Ordering::SeqCst);
        self.store.check_fault(Operation::Get)?;
        self.inner()
            .state
            .read()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(id.to_string()))
    }

    async fn delete_one(&self, id: &str) -> StoreResult<()> {
        self.inner().counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.store.check_fault(Operation::Delete)?;
        let mut state = self.inner().state.write();
        if state.documents.remove(id).is_none() {
            return Err(StoreError::KeyNotFound(id.to_string()));
        }
        if let Ok((timestamp, logical_key)) = codec::decode(id) {
            state.pending.push(IndexChange::Remove {
                key: codec::index_key(logical_key, timestamp),
            });
        }
        trace!(%id, "Deleted document");
        Ok(())
    }

    async fn range_scan(&self, query: &ViewQuery) -> StoreResult<Vec<IndexRow>> {
        self.inner().counters.scans.fetch_add(1, Ordering::SeqCst);
        self.store.check_fault(Operation::Scan)?;
        let view = &self.inner().view;
        if query.design_doc != view.design_doc || query.design_view != view.design_view {
            return Err(StoreError::Backend(anyhow!(
                "view {}/{} not found",
                query.design_doc,
                query.design_view
            )));
        }

        let mut state = self.inner().state.write();
        if query.stale == Staleness::UpdateBefore {
            state.refresh_index();
        }

        let (low, high) = match query.order {
            SortOrder::Ascending => (&query.start_key, &query.end_key),
            SortOrder::Descending => (&query.end_key, &query.start_key),
        };
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        let rows: Vec<IndexRow> = if low > high {
            Vec::new()
        } else {
            let range = state.index.range::<str, _>((
                Bound::Included(low.as_str()),
                Bound::Included(high.as_str()),
            ));
            let to_row = |(key, id): (&String, &String)| IndexRow {
                key: key.clone(),
                id: id.clone(),
            };
            match query.order {
                SortOrder::Ascending => range.skip(skip).take(limit).map(to_row).collect(),
                SortOrder::Descending => range.rev().skip(skip).take(limit).map(to_row).collect(),
            }
        };

        if query.stale == Staleness::UpdateAfter {
            state.refresh_index();
        }
        debug!(
            start = %query.start_key,
            end = %query.end_key,
            order = ?query.order,
            rows = rows.len(),
            "Scanned view"
        );
        Ok(rows)
    }
}
