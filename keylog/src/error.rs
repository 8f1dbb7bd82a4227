//! Error types for the keylog access layer.
use crate::store::StoreError;
use thiserror::Error;

/// The primary error type for operations within this library.
#[derive(Error, Debug)]
pub enum KeylogError {
    /// The logical key is empty or contains the id separator. Raised before
    /// the store is contacted.
    #[error("Invalid logical key {0:?}: must be a non-empty string without '|'")]
    InvalidKey(String),

    /// A caller-supplied document id does not belong to the logical key the
    /// operation was issued for.
    #[error("Document id '{id}' does not belong to logical key '{key}'")]
    KeyMismatch { id: String, key: String },

    /// A document id could not be split into its timestamp and logical key.
    #[error("Malformed document id '{0}'")]
    MalformedId(String),

    /// The backing store timed out. The cached connection has been dropped and
    /// the next call reconnects.
    #[error("Store operation timed out: {0}")]
    Timeout(String),

    /// The connection to the backing store could not be established.
    #[error("Unable to connect to store: {0}")]
    Connection(String),

    /// Any other failure reported by the backing store, surfaced verbatim.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// The payload could not be converted to or from its stored JSON form.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<StoreError> for KeylogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(msg) => KeylogError::Timeout(msg),
            StoreError::Connection(msg) => KeylogError::Connection(msg),
            other => KeylogError::Store(other),
        }
    }
}

impl KeylogError {
    /// True when the error should drop the cached store connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, KeylogError::Timeout(_))
    }
}

/// A convenience type alias for `Result<T, KeylogError>`.
pub type Result<T, E = KeylogError> = std::result::Result<T, E>;
