// --- High-Level Client ---
use serde::Serialize;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock, TimestampIssuer};
use crate::codec;
use crate::config::Config;
use crate::error::{KeylogError, Result};
use crate::options::normalize;
use crate::query::{IntervalQueryBuilder, ViewQuery};
use crate::store::{Bucket, Connector, StoreError, StoreResult};
use crate::types::{
    Document, GetResult, HitRecord, QueryOptions, RawQueryOptions, RemoveResult, SortOrder,
};

/// Lifecycle of the cached store connection.
enum ConnectionState<B> {
    Disconnected,
    Connecting,
    Connected(Arc<B>),
}

/// Observable connection status, see [`KeylogClient::connection_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Puts the state back to `Disconnected` if a connect is dropped midway.
struct ConnectingGuard<'a, B> {
    state: &'a RwLock<ConnectionState<B>>,
}

impl<B> Drop for ConnectingGuard<'_, B> {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if matches!(*state, ConnectionState::Connecting) {
            *state = ConnectionState::Disconnected;
        }
    }
}

/// Where the ids of a `get`/`remove` come from.
enum IdSource {
    /// Caller-supplied ids, already checked for ownership.
    Explicit(Vec<String>),
    /// A view scan over the requested interval.
    Scan(ViewQuery),
}

/// Time-ordered document log over a view-indexed document store.
///
/// The connection to the store is opened lazily on first use and shared by
/// all callers. Establishment is serialized, so concurrent first calls open
/// a single connection. A timeout reported by any store operation drops the
/// connection and the next call reconnects; other errors leave it alone.
pub struct KeylogClient<C: Connector> {
    connector: C,
    config: Config,
    state: RwLock<ConnectionState<C::Bucket>>,
    connect_lock: Mutex<()>,
    queries: IntervalQueryBuilder,
    issuer: TimestampIssuer,
}

impl<C: Connector> KeylogClient<C> {
    /// Creates a client using the system clock. Does not connect.
    pub fn new(connector: C, config: Config) -> Result<Self> {
        Self::with_clock(connector, config, Arc::new(SystemClock))
    }

    /// Creates a client that timestamps inserts with `clock`.
    pub fn with_clock(connector: C, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let queries = IntervalQueryBuilder::new(config.views.search.clone(), config.precision);
        let issuer = TimestampIssuer::new(clock, config.precision);
        info!(
            hosts = %config.connection_string(),
            bucket = %config.bucket,
            "Created KeylogClient"
        );
        Ok(Self {
            connector,
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: Mutex::new(()),
            queries,
            issuer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current connection status. Never waits on an ongoing connect.
    pub fn connection_status(&self) -> ConnectionStatus {
        match &*self.state.read() {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
        }
    }

    fn connected(&self) -> Option<Arc<C::Bucket>> {
        match &*self.state.read() {
            ConnectionState::Connected(bucket) => Some(Arc::clone(bucket)),
            _ => None,
        }
    }

    /// Returns the live bucket, connecting first if there is none.
    async fn bucket(&self) -> Result<Arc<C::Bucket>> {
        if let Some(bucket) = self.connected() {
            return Ok(bucket);
        }
        let _connecting = self.connect_lock.lock().await;
        // Another caller may have connected while we waited.
        if let Some(bucket) = self.connected() {
            return Ok(bucket);
        }

        *self.state.write() = ConnectionState::Connecting;
        let _guard = ConnectingGuard { state: &self.state };
        info!(
            hosts = %self.config.connection_string(),
            bucket = %self.config.bucket,
            "Connecting to store"
        );
        match self.connector.connect(&self.config).await {
            Ok(bucket) => {
                *self.state.write() = ConnectionState::Connected(Arc::clone(&bucket));
                info!("Connected to store");
                Ok(bucket)
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                warn!(error = %e, "Failed to connect to store");
                Err(match e {
                    StoreError::Timeout(msg) => KeylogError::Timeout(msg),
                    other => KeylogError::Connection(other.to_string()),
                })
            }
        }
    }

    /// Drops the cached connection if it is still `bucket`.
    fn invalidate(&self, bucket: &Arc<C::Bucket>) {
        let mut state = self.state.write();
        if let ConnectionState::Connected(current) = &*state {
            if Arc::ptr_eq(current, bucket) {
                *state = ConnectionState::Disconnected;
                info!("Store timed out, connection invalidated");
            }
        }
    }

    /// Converts a store result, invalidating the connection on timeout.
    fn observe<T>(&self, bucket: &Arc<C::Bucket>, result: StoreResult<T>) -> Result<T> {
        result.map_err(|e| {
            let err = KeylogError::from(e);
            if err.is_timeout() {
                self.invalidate(bucket);
            }
            err
        })
    }

    /// Stores `payload` under `logical_key` and returns the new document id.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %logical_key))]
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        logical_key: &str,
        payload: &T,
    ) -> Result<String> {
        codec::validate_key(logical_key)?;
        let data = serde_json::to_value(payload)?;
        let bucket = self.bucket().await?;

        let timestamp = self.issuer.next();
        let id = codec::encode(logical_key, timestamp)?;
        let document = Document {
            data,
            time: self.issuer.precision().to_millis(timestamp),
        };
        let result = bucket.put(&id, &document).await;
        self.observe(&bucket, result)?;
        debug!(%id, time = document.time, "Inserted document");
        Ok(id)
    }

    /// Fetches the documents of `logical_key` selected by `options`.
    ///
    /// Hits are sorted by `time` in the requested order. Documents removed
    /// between the index read and the fetch are silently left out.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %logical_key))]
    pub async fn get(&self, logical_key: &str, options: RawQueryOptions) -> Result<GetResult> {
        let (query, source) = self.plan(logical_key, &options)?;
        let Some(source) = source else {
            return Ok(GetResult {
                hits: Vec::new(),
                query,
            });
        };

        let bucket = self.bucket().await?;
        let ids = self.resolve_ids(&bucket, source).await?;
        if ids.is_empty() {
            debug!("No ids resolved, skipping fetch");
            return Ok(GetResult {
                hits: Vec::new(),
                query,
            });
        }

        let result = bucket.get_many(&ids).await;
        let mut documents = self.observe(&bucket, result)?;
        let mut hits: Vec<HitRecord> = ids
            .into_iter()
            .filter_map(|id| {
                let document = documents.remove(&id);
                if document.is_none() {
                    trace!(%id, "Document missing at fetch, dropped from hits");
                }
                document.map(|d| HitRecord::new(id, d))
            })
            .collect();
        sort_hits(&mut hits, query.sort);
        debug!(hits = hits.len(), "Get complete");
        Ok(GetResult { hits, query })
    }

    /// Deletes the documents of `logical_key` selected by `options`.
    ///
    /// Deletes run concurrently. An id that is already gone counts as done.
    /// The first other failure is returned; deletes already in flight still
    /// run to completion and nothing is rolled back.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %logical_key))]
    pub async fn remove(
        &self,
        logical_key: &str,
        options: RawQueryOptions,
    ) -> Result<RemoveResult> {
        let (query, source) = self.plan(logical_key, &options)?;
        let Some(source) = source else {
            return Ok(RemoveResult {
                nb_removals: 0,
                query,
            });
        };

        let bucket = self.bucket().await?;
        let ids = self.resolve_ids(&bucket, source).await?;

        let deletes: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let bucket = Arc::clone(&bucket);
                tokio::spawn(async move {
                    let result = bucket.delete_one(&id).await;
                    (id, result)
                })
            })
            .collect();

        let mut nb_removals = 0;
        for delete in deletes {
            let (id, result) = delete
                .await
                .map_err(|e| KeylogError::Store(StoreError::Backend(e.into())))?;
            match result {
                Ok(()) => nb_removals += 1,
                Err(e) if e.is_not_found() => trace!(%id, "Already absent, nothing to delete"),
                Err(e) => {
                    warn!(%id, error = %e, "Delete failed, aborting remove");
                    return self.observe(&bucket, Err(e));
                }
            }
        }
        debug!(nb_removals, "Remove complete");
        Ok(RemoveResult { nb_removals, query })
    }

    /// Validates the call and decides where ids come from, without touching
    /// the store. `None` means the query cannot match anything.
    fn plan(
        &self,
        logical_key: &str,
        options: &RawQueryOptions,
    ) -> Result<(QueryOptions, Option<IdSource>)> {
        codec::validate_key(logical_key)?;
        let query = normalize(options, &self.config.defaults);

        if let Some(ids) = query.id_list() {
            if let Some(foreign) = ids.iter().find(|id| !codec::belongs_to(id, logical_key)) {
                return Err(KeylogError::KeyMismatch {
                    id: foreign.clone(),
                    key: logical_key.to_string(),
                });
            }
            let source = IdSource::Explicit(ids.to_vec());
            return Ok((query, Some(source)));
        }

        let source = self.queries.view_query(logical_key, &query).map(IdSource::Scan);
        if source.is_none() {
            debug!(?query, "Interval is empty, short-circuiting");
        }
        Ok((query, source))
    }

    async fn resolve_ids(&self, bucket: &Arc<C::Bucket>, source: IdSource) -> Result<Vec<String>> {
        match source {
            IdSource::Explicit(ids) => Ok(ids),
            IdSource::Scan(view_query) => {
                let result = bucket.range_scan(&view_query).await;
                let rows = self.observe(bucket, result)?;
                debug!(rows = rows.len(), "Resolved ids from view");
                Ok(rows.into_iter().map(|row| row.id).collect())
            }
        }
    }
}

/// Orders hits by `time`; equal times keep their relative order.
fn sort_hits(hits: &mut [HitRecord], sort: SortOrder) {
    match sort {
        SortOrder::Ascending => hits.sort_by(|a, b| a.time.cmp(&b.time)),
        SortOrder::Descending => hits.sort_by(|a, b| b.time.cmp(&a.time)),
    }
}
