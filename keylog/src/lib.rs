//! Time-ordered, range-queryable document logs over a key/document store.
//!
//! Every logical key names a stream of immutable documents. Each document is
//! stored under an id that embeds its insertion time, and a store-maintained
//! view (`logicalKey|timestamp -> id`) lets [`KeylogClient`] fetch or delete
//! any time interval of a stream with a single range scan.
//!
//! ```ignore
//! let client = KeylogClient::new(MemoryStore::new(), Config::new("localhost", 8091, "default"))?;
//! let id = client.insert("sensor-1", &json!({ "temp": 21.5 })).await?;
//! let recent = client
//!     .get("sensor-1", RawQueryOptions::new().after_in(since_millis).limit(10))
//!     .await?;
//! ```
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod options;
pub mod query;
pub mod store;
pub mod types;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{Config, QueryDefaults, ViewConfig, ViewsConfig};
pub use error::{KeylogError, Result};
pub use manager::{ConnectionStatus, KeylogClient};
pub use memory::{FaultKind, MemoryStore, Operation};
pub use query::{IntervalQueryBuilder, ScanRange, ViewQuery};
pub use store::{Bucket, Connector, IndexRow, Staleness, StoreError, StoreResult};
pub use types::{
    Document, GetResult, HitRecord, QueryOptions, RawQueryOptions, RemoveResult, SortOrder,
    TimePrecision,
};

#[cfg(test)]
mod test;
