//! Configuration for a [`KeylogClient`](crate::KeylogClient).
//!
//! The shape mirrors the JSON documents deployments already carry:
//!
//! ```json
//! {
//!   "hosts": ["db-1", "db-2"],
//!   "ports": [8091, 8091],
//!   "bucket": "default",
//!   "views": { "search": { "designDoc": "search", "designView": "search" } },
//!   "password": "secret",
//!   "defaults": { "sort": "DESC", "limit": 100 },
//!   "precision": "micros"
//! }
//! ```
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path};
use tracing::debug;

use crate::error::{KeylogError, Result};
use crate::types::{SortOrder, TimePrecision};

/// Default number of hits returned when a query does not set `limit`.
pub const DEFAULT_LIMIT: u64 = 100;

/// Design document and view backing the `logicalKey -> timestamp` index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
    pub design_doc: String,
    pub design_view: String,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            design_doc: "search".to_string(),
            design_view: "search".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewsConfig {
    pub search: ViewConfig,
}

/// Values the normalizer falls back to when a query leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub sort: SortOrder,
    pub limit: u64,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            sort: SortOrder::Descending,
            limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Store hosts, paired index-wise with `ports`.
    pub hosts: Vec<String>,
    pub ports: Vec<u16>,
    /// Bucket (namespace) holding the documents.
    pub bucket: String,
    #[serde(default)]
    pub views: ViewsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub defaults: QueryDefaults,
    /// Unit of the timestamp embedded in document ids.
    #[serde(default)]
    pub precision: TimePrecision,
}

impl Config {
    /// Single-host configuration with every other setting defaulted.
    pub fn new(host: impl Into<String>, port: u16, bucket: impl Into<String>) -> Self {
        Self {
            hosts: vec![host.into()],
            ports: vec![port],
            bucket: bucket.into(),
            views: ViewsConfig::default(),
            password: None,
            defaults: QueryDefaults::default(),
            precision: TimePrecision::default(),
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Config = serde_json::from_reader(reader)
            .map_err(|e| KeylogError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            KeylogError::Config(format!("Failed to open configuration {:?}: {}", path, e))
        })?;
        debug!("Loading configuration from {:?}", path);
        Self::from_reader(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(KeylogError::Config("at least one host is required".into()));
        }
        if self.hosts.len() != self.ports.len() {
            return Err(KeylogError::Config(format!(
                "{} hosts but {} ports; each host needs a port",
                self.hosts.len(),
                self.ports.len()
            )));
        }
        if self.bucket.is_empty() {
            return Err(KeylogError::Config("bucket name is empty".into()));
        }
        if self.defaults.limit == 0 {
            return Err(KeylogError::Config("default limit must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` pairs joined with commas, as cluster clients expect them.
    pub fn connection_string(&self) -> String {
        self.hosts
            .iter()
            .zip(&self.ports)
            .map(|(host, port)| format!("{}:{}", host, port))
            .collect::<Vec<_>>()
            .join(",")
    }
}
