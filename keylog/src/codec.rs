//! Composite document id encoding.
//!
//! A document id is `<timestamp>|<logical key>`, the timestamp rendered as a
//! zero-padded decimal of [`TIMESTAMP_WIDTH`] digits so that, for a given
//! logical key, lexicographic id order is chronological order. The secondary
//! index is keyed the other way round (`<logical key>|<timestamp>`) so that a
//! single logical key occupies one contiguous, time-ordered key range.

use crate::error::{KeylogError, Result};

/// Separator between timestamp and logical key.
pub const SEPARATOR: char = '|';

/// Digits in an encoded timestamp; wide enough for `u64::MAX`.
pub const TIMESTAMP_WIDTH: usize = 20;

/// Sorts above every digit, closing an unbounded upper end of a key range.
pub const MAX_KEY_SENTINEL: &str = "\u{02ad}";

/// Sorts below every digit, opening an unbounded lower end of a key range.
pub const MIN_KEY_SENTINEL: &str = "";

/// Rejects logical keys that would break prefix matching.
pub fn validate_key(logical_key: &str) -> Result<()> {
    if logical_key.is_empty() || logical_key.contains(SEPARATOR) {
        return Err(KeylogError::InvalidKey(logical_key.to_string()));
    }
    Ok(())
}

/// Renders a timestamp at fixed width.
pub fn format_timestamp(timestamp: u64) -> String {
    format!("{:0width$}", timestamp, width = TIMESTAMP_WIDTH)
}

/// Builds the document id for `logical_key` at `timestamp`.
pub fn encode(logical_key: &str, timestamp: u64) -> Result<String> {
    validate_key(logical_key)?;
    Ok(format!(
        "{}{}{}",
        format_timestamp(timestamp),
        SEPARATOR,
        logical_key
    ))
}

/// Splits a document id into its timestamp and logical key.
pub fn decode(document_id: &str) -> Result<(u64, &str)> {
    let malformed = || KeylogError::MalformedId(document_id.to_string());
    let (timestamp, logical_key) = document_id.split_once(SEPARATOR).ok_or_else(malformed)?;
    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let timestamp = timestamp.parse::<u64>().map_err(|_| malformed())?;
    Ok((timestamp, logical_key))
}

/// True iff `document_id` decodes to exactly `logical_key`. A shared string
/// prefix is not enough.
pub fn belongs_to(document_id: &str, logical_key: &str) -> bool {
    matches!(decode(document_id), Ok((_, key)) if key == logical_key)
}

/// Prefix shared by every index key of `logical_key`.
pub fn index_prefix(logical_key: &str) -> String {
    format!("{}{}", logical_key, SEPARATOR)
}

/// Secondary index key for a document of `logical_key` at `timestamp`.
pub fn index_key(logical_key: &str, timestamp: u64) -> String {
    format!("{}{}", index_prefix(logical_key), format_timestamp(timestamp))
}
