use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::ops::Bound;

use crate::error::Result;

// --- Basic Data Types ---

/// Emission order of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[serde(rename = "ASC")]
    Ascending,
    #[default]
    #[serde(rename = "DESC")]
    Descending,
}

impl SortOrder {
    pub fn is_descending(self) -> bool {
        self == SortOrder::Descending
    }
}

/// Unit of the timestamp embedded in document ids.
///
/// `Document::time` is always milliseconds; this only controls how finely the
/// id (and therefore the secondary index) orders documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePrecision {
    #[default]
    Micros,
    Millis,
}

impl TimePrecision {
    /// Number of id timestamp units in one millisecond.
    pub fn units_per_milli(self) -> u64 {
        match self {
            TimePrecision::Micros => 1_000,
            TimePrecision::Millis => 1,
        }
    }

    /// Reduces an id timestamp to milliseconds.
    pub fn to_millis(self, timestamp: u64) -> i64 {
        (timestamp / self.units_per_milli()) as i64
    }
}

/// Stored document shape: `{ "data": <opaque>, "time": <epoch millis> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub data: Value,
    pub time: i64,
}

/// One document returned by `get`, tagged with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    pub id: String,
    pub data: Value,
    pub time: i64,
}

impl HitRecord {
    pub(crate) fn new(id: String, document: Document) -> Self {
        Self {
            id,
            data: document.data,
            time: document.time,
        }
    }

    /// Deserializes the opaque payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Query options as received from the caller, before normalization.
///
/// Every scalar field is kept as a raw JSON value so that junk input
/// (strings, negative numbers, floats) survives until the normalizer decides
/// what to do with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawQueryOptions {
    pub sort: Option<Value>,
    pub skip: Option<Value>,
    pub limit: Option<Value>,
    pub after_in: Option<Value>,
    pub after_ex: Option<Value>,
    pub before_in: Option<Value>,
    pub before_ex: Option<Value>,
    pub ids: Option<Vec<String>>,
}

impl RawQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leniently reads an options object. Anything that is not an object
    /// yields empty options; non-string entries of `ids` are ignored.
    pub fn from_json(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        let field = |name: &str| map.get(name).filter(|v| !v.is_null()).cloned();
        let ids = map.get("ids").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });
        Self {
            sort: field("sort"),
            skip: field("skip"),
            limit: field("limit"),
            after_in: field("afterIn"),
            after_ex: field("afterEx"),
            before_in: field("beforeIn"),
            before_ex: field("beforeEx"),
            ids,
        }
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = Some(match sort {
            SortOrder::Ascending => Value::from(1),
            SortOrder::Descending => Value::from(-1),
        });
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(Value::from(skip));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(Value::from(limit));
        self
    }

    pub fn after_in(mut self, millis: i64) -> Self {
        self.after_in = Some(Value::from(millis));
        self
    }

    pub fn after_ex(mut self, millis: i64) -> Self {
        self.after_ex = Some(Value::from(millis));
        self
    }

    pub fn before_in(mut self, millis: i64) -> Self {
        self.before_in = Some(Value::from(millis));
        self
    }

    pub fn before_ex(mut self, millis: i64) -> Self {
        self.before_ex = Some(Value::from(millis));
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }
}

/// Normalized query options.
///
/// At most one lower bound (`after_in`/`after_ex`) and one upper bound
/// (`before_in`/`before_ex`) is set, bounds are positive milliseconds, and
/// the lower bound never exceeds the upper one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub sort: SortOrder,
    pub skip: u64,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_ex: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_ex: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

impl QueryOptions {
    /// Lower end of the requested interval, in milliseconds.
    pub fn lower_bound(&self) -> Bound<i64> {
        match (self.after_in, self.after_ex) {
            (Some(a), _) => Bound::Included(a),
            (None, Some(a)) => Bound::Excluded(a),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Upper end of the requested interval, in milliseconds.
    pub fn upper_bound(&self) -> Bound<i64> {
        match (self.before_in, self.before_ex) {
            (Some(b), _) => Bound::Included(b),
            (None, Some(b)) => Bound::Excluded(b),
            (None, None) => Bound::Unbounded,
        }
    }

    /// The explicit id list, if one was given and is non-empty.
    pub fn id_list(&self) -> Option<&[String]> {
        self.ids.as_deref().filter(|ids| !ids.is_empty())
    }
}

/// Result of `get`: the hits plus the options actually applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResult {
    pub hits: Vec<HitRecord>,
    pub query: QueryOptions,
}

/// Result of `remove`: how many documents were deleted plus the options
/// actually applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResult {
    pub nb_removals: usize,
    pub query: QueryOptions,
}
