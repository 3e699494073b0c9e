//! Pending local writes awaiting delivery.

use crate::row::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Builds the deterministic operation key for an entity.
///
/// The key doubles as the pending-op id and the conflict id, so one entity
/// can never hold more than one queued write or one open conflict.
pub fn op_key(table: &str, entity_id: &str) -> String {
    format!("{table}:{entity_id}")
}

/// Kind of queued operation.
///
/// Runebook models every local write as an idempotent whole-row upsert;
/// deletes are tombstoned rows, not a separate operation kind. The enum
/// keeps a stable wire tag so the persisted queue stays readable if more
/// kinds ever appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Insert-or-update of a whole row, keyed by primary key.
    Upsert,
}

impl OpKind {
    /// Returns the persisted tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Upsert => "upsert",
        }
    }

    /// Parses a persisted tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "upsert" => Some(OpKind::Upsert),
            _ => None,
        }
    }
}

/// A local write queued for delivery to the remote store.
///
/// # Invariants
///
/// - `op_id` is always `op_key(&table, &entity_id)`
/// - At most one pending op exists per entity: re-enqueueing replaces
///   `payload` and `updated_at` in place and preserves `created_at`, so the
///   queue stays FIFO by first enqueue time and never grows per entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    /// Deterministic `table:id` key.
    pub op_id: String,
    /// Table the write targets.
    pub table: String,
    /// Primary-key value of the written row.
    pub entity_id: String,
    /// Operation kind.
    pub kind: OpKind,
    /// Snapshot of the row at enqueue time.
    pub payload: Row,
    /// First time a write for this entity was queued.
    pub created_at: DateTime<Utc>,
    /// Last time the queued payload was refreshed.
    pub updated_at: DateTime<Utc>,
}

impl PendingOp {
    /// Creates a pending upsert for `table`/`entity_id` with both
    /// timestamps set to `now`.
    pub fn upsert(table: &str, entity_id: &str, payload: Row, now: DateTime<Utc>) -> Self {
        Self {
            op_id: op_key(table, entity_id),
            table: table.to_string(),
            entity_id: entity_id.to_string(),
            kind: OpKind::Upsert,
            payload,
            created_at: now,
            updated_at: now,
        }
    }
}
