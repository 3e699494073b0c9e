//! Row payloads and field accessors.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Update-timestamp column carried by every synced table.
///
/// The remote delta query filters and orders on this column, and the pull
/// path compares it across local and remote rows, so the name is a protocol
/// convention rather than per-table configuration.
pub const UPDATED_AT: &str = "updated_at";

/// A synced record payload: one JSON object, keyed by column name.
///
/// Rows travel in both directions — snapshots of local writes queued for
/// delivery, and remote deltas fetched during a pull — so accessors here are
/// deliberately tolerant: an absent, null, or malformed field reads as
/// `None` rather than an error.
pub type Row = serde_json::Map<String, Value>;

/// Reads the row's value for `field` as a string identifier.
///
/// Numeric primary keys are rendered in decimal so `table:id` operation keys
/// stay deterministic regardless of how the remote serializes them.
pub fn row_id(row: &Row, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads the row's value for `field` as an RFC 3339 timestamp.
///
/// Remote stores serialize `timestamptz` columns as RFC 3339 text; local
/// rows carry the same representation. Anything else reads as `None` — a
/// missing timestamp is an expected state (e.g. a row created before the
/// column existed), not a protocol error.
pub fn row_timestamp(row: &Row, field: &str) -> Option<DateTime<Utc>> {
    match row.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}
