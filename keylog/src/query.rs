//! Interval query compilation.
//!
//! Turns a logical key plus normalized [`QueryOptions`] into a single range
//! scan over the `logicalKey|timestamp` view. The view only supports closed
//! scans (inclusive start and end keys) over one ascending key space, so every
//! open end of the requested interval is first turned into a closed one by
//! moving it one millisecond inwards. The resulting closed range does not
//! depend on the sort order; a descending scan walks the same range from its
//! upper end down.
use serde::Serialize;
use std::ops::Bound;
use tracing::{debug, trace};

use crate::codec::{format_timestamp, index_prefix, MAX_KEY_SENTINEL, MIN_KEY_SENTINEL};
use crate::config::ViewConfig;
use crate::store::Staleness;
use crate::types::{QueryOptions, SortOrder, TimePrecision};

/// Compiled scan descriptor. Ephemeral, one per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRange {
    pub start_key: String,
    pub end_key: String,
    pub order: SortOrder,
}

/// A complete view request as handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewQuery {
    pub design_doc: String,
    pub design_view: String,
    /// Inclusive; the first key emitted in `order`.
    pub start_key: String,
    /// Inclusive; the last key emitted in `order`.
    pub end_key: String,
    pub order: SortOrder,
    pub skip: u64,
    pub limit: u64,
    pub stale: Staleness,
}

/// Closed interval in id timestamp units. `None` on a side means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedRange {
    pub low: Option<u64>,
    pub high: Option<u64>,
}

/// Converts the millisecond interval of `options` into a closed range of id
/// timestamps. Returns `None` when the interval cannot match anything.
pub fn closed_range(options: &QueryOptions, precision: TimePrecision) -> Option<ClosedRange> {
    let scale = precision.units_per_milli();
    // Bounds are positive after normalization; anything else falls to Unbounded.
    let to_units = |millis: i64| u64::try_from(millis).ok();

    // A lower bound past u64::MAX leaves nothing to match.
    let low = match options.lower_bound() {
        Bound::Included(a) => match to_units(a) {
            Some(a) => Some(a.checked_mul(scale)?),
            None => None,
        },
        Bound::Excluded(a) => match to_units(a) {
            Some(a) => Some(a.checked_add(1)?.checked_mul(scale)?),
            None => None,
        },
        Bound::Unbounded => None,
    };
    // An upper bound past u64::MAX is no bound at all.
    let high = match options.upper_bound() {
        Bound::Included(b) => to_units(b)
            .and_then(|b| b.checked_add(1))
            .and_then(|b| b.checked_mul(scale))
            .map(|end| end - 1),
        Bound::Excluded(b) => to_units(b)
            .and_then(|b| b.checked_mul(scale))
            .map(|end| end.saturating_sub(1)),
        Bound::Unbounded => None,
    };

    // An upper bound below the epoch excludes everything.
    match options.upper_bound() {
        Bound::Included(b) if b < 0 => return None,
        Bound::Excluded(b) if b <= 0 => return None,
        _ => {}
    }
    if let (Some(low), Some(high)) = (low, high) {
        if low > high {
            trace!(low, high, "Interval is empty");
            return None;
        }
    }
    Some(ClosedRange { low, high })
}

/// Compiles interval queries against one view.
#[derive(Debug, Clone)]
pub struct IntervalQueryBuilder {
    view: ViewConfig,
    precision: TimePrecision,
}

impl IntervalQueryBuilder {
    pub fn new(view: ViewConfig, precision: TimePrecision) -> Self {
        Self { view, precision }
    }

    /// Builds the scan descriptor for `logical_key`, or `None` when the
    /// requested interval is empty.
    pub fn build(&self, logical_key: &str, options: &QueryOptions) -> Option<ScanRange> {
        let range = closed_range(options, self.precision)?;
        let prefix = index_prefix(logical_key);
        let low_key = match range.low {
            Some(low) => format!("{}{}", prefix, format_timestamp(low)),
            None => format!("{}{}", prefix, MIN_KEY_SENTINEL),
        };
        let high_key = match range.high {
            Some(high) => format!("{}{}", prefix, format_timestamp(high)),
            None => format!("{}{}", prefix, MAX_KEY_SENTINEL),
        };
        let (start_key, end_key) = match options.sort {
            SortOrder::Ascending => (low_key, high_key),
            SortOrder::Descending => (high_key, low_key),
        };
        let scan = ScanRange {
            start_key,
            end_key,
            order: options.sort,
        };
        debug!(%logical_key, ?range, ?scan, "Compiled interval scan");
        Some(scan)
    }

    /// Builds the full view request, always asking for a fresh index.
    pub fn view_query(&self, logical_key: &str, options: &QueryOptions) -> Option<ViewQuery> {
        let scan = self.build(logical_key, options)?;
        Some(ViewQuery {
            design_doc: self.view.design_doc.clone(),
            design_view: self.view.design_view.clone(),
            start_key: scan.start_key,
            end_key: scan.end_key,
            order: scan.order,
            skip: options.skip,
            limit: options.limit,
            stale: Staleness::UpdateBefore,
        })
    }
}
