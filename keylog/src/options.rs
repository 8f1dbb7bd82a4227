//! Query option normalization.
//!
//! Turns whatever the caller passed into a [`QueryOptions`] the interval
//! builder can trust. Normalization never fails: junk values fall back to
//! defaults, duplicate bounds are collapsed and inverted intervals are
//! swapped back into order.
use serde_json::Value;
use std::collections::HashSet;
use tracing::{trace, warn};

use crate::config::QueryDefaults;
use crate::types::{QueryOptions, RawQueryOptions, SortOrder};

/// Reads a strictly positive integer out of a raw option value.
///
/// Floats are truncated; strings, booleans and anything `<= 0` yield `None`.
fn positive_int(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(n) = value.as_u64() {
        return (n > 0).then_some(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 1.0 && f <= u64::MAX as f64 => Some(f.trunc() as u64),
        _ => None,
    }
}

/// Like [`positive_int`] but for interval bounds, which are epoch milliseconds.
fn positive_millis(value: Option<&Value>) -> Option<i64> {
    positive_int(value).and_then(|n| i64::try_from(n).ok())
}

fn is_ascending_sentinel(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => s.eq_ignore_ascii_case("asc") || s.eq_ignore_ascii_case("ascending"),
        _ => false,
    }
}

fn normalize_sort(value: Option<&Value>, default: SortOrder) -> SortOrder {
    match value {
        None => default,
        Some(v) if is_ascending_sentinel(v) => SortOrder::Ascending,
        Some(_) => SortOrder::Descending,
    }
}

/// Keeps the first occurrence of every id; an empty list counts as absent.
fn dedup_ids(ids: Option<&Vec<String>>) -> Option<Vec<String>> {
    let ids = ids?;
    let mut seen = HashSet::with_capacity(ids.len());
    let unique: Vec<String> = ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();
    (!unique.is_empty()).then_some(unique)
}

/// Validates `raw` and fills defaults. See the module docs.
pub fn normalize(raw: &RawQueryOptions, defaults: &QueryDefaults) -> QueryOptions {
    let mut options = QueryOptions {
        sort: normalize_sort(raw.sort.as_ref(), defaults.sort),
        skip: positive_int(raw.skip.as_ref()).unwrap_or(0),
        limit: positive_int(raw.limit.as_ref()).unwrap_or(defaults.limit),
        after_in: positive_millis(raw.after_in.as_ref()),
        after_ex: positive_millis(raw.after_ex.as_ref()),
        before_in: positive_millis(raw.before_in.as_ref()),
        before_ex: positive_millis(raw.before_ex.as_ref()),
        ids: dedup_ids(raw.ids.as_ref()),
    };

    // Inclusive bounds win over exclusive ones on the same side.
    if options.after_in.is_some() && options.after_ex.take().is_some() {
        warn!(after_in = ?options.after_in, "Both afterIn and afterEx given, dropping afterEx");
    }
    if options.before_in.is_some() && options.before_ex.take().is_some() {
        warn!(
            before_in = ?options.before_in,
            "Both beforeIn and beforeEx given, dropping beforeEx"
        );
    }

    repair_interval(&mut options);
    trace!(?options, "Normalized query options");
    options
}

/// Swaps the lower and upper bound values when they arrive in the wrong
/// relative order. Each side keeps its inclusive/exclusive kind.
fn repair_interval(options: &mut QueryOptions) {
    let QueryOptions {
        after_in,
        after_ex,
        before_in,
        before_ex,
        sort,
        ..
    } = options;
    let lower = after_in.as_mut().or(after_ex.as_mut());
    let upper = before_in.as_mut().or(before_ex.as_mut());
    if let (Some(after), Some(before)) = (lower, upper) {
        if *after > *before {
            warn!(
                after = *after,
                before = *before,
                ?sort,
                "Interval bounds given in reverse order, swapping"
            );
            std::mem::swap(after, before);
        }
    }
}
