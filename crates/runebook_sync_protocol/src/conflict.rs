//! Conflict records and the conflict-decision predicate.

use crate::pending::op_key;
use crate::row::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decides whether an incoming remote row must be surfaced as a conflict.
///
/// A conflict is raised iff a local pending op exists AND the remote row
/// carries an update timestamp AND either the local row has no timestamp of
/// its own or the remote one is strictly greater.
///
/// The asymmetry around missing timestamps is deliberate: a remote row with
/// no timestamp cannot be shown to supersede anything, so it never
/// conflicts, while a local row with no timestamp represents unobserved
/// local state — overwriting it silently would lose an edit, so the
/// divergence is raised for an operator instead.
pub fn requires_resolution(
    has_pending_op: bool,
    local_updated_at: Option<DateTime<Utc>>,
    remote_updated_at: Option<DateTime<Utc>>,
) -> bool {
    if !has_pending_op {
        return false;
    }
    let Some(remote) = remote_updated_at else {
        return false;
    };
    match local_updated_at {
        None => true,
        Some(local) => remote > local,
    }
}

/// Operator decision for a recorded divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the queued local edit; it delivers on the next push.
    KeepLocal,
    /// Overwrite the local row with the stored remote payload.
    KeepRemote,
}

impl ConflictResolution {
    /// Returns the persisted tag for this resolution.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepRemote => "keep_remote",
        }
    }

    /// Parses a persisted tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "keep_local" => Some(ConflictResolution::KeepLocal),
            "keep_remote" => Some(ConflictResolution::KeepRemote),
            _ => None,
        }
    }
}

/// A recorded divergence between a queued local edit and a newer remote row.
///
/// # Invariants
///
/// - `conflict_id` is always `op_key(&table, &entity_id)`
/// - At most one *open* (`resolved_at` null) conflict exists per entity; a
///   fresh divergence reopens and overwrites a previously resolved record
///   for the same key
/// - While a conflict is open, neither push nor pull touches the entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Deterministic `table:id` key.
    pub conflict_id: String,
    /// Table the divergence occurred in.
    pub table: String,
    /// Primary-key value of the diverged row.
    pub entity_id: String,
    /// Snapshot of the local row when the divergence was observed, or a
    /// minimal `{pk: id}` stub if no local row existed yet.
    pub local_payload: Row,
    /// The incoming remote row.
    pub remote_payload: Row,
    /// Update timestamp the local row carried, if any.
    pub local_updated_at: Option<DateTime<Utc>>,
    /// Update timestamp the remote row carried, if any.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// When the divergence was observed.
    pub detected_at: DateTime<Utc>,
    /// When an operator resolved it, if they have.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Which side the operator kept.
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Creates a new open conflict for `table`/`entity_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        table: &str,
        entity_id: &str,
        local_payload: Row,
        remote_payload: Row,
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: Option<DateTime<Utc>>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conflict_id: op_key(table, entity_id),
            table: table.to_string(),
            entity_id: entity_id.to_string(),
            local_payload,
            remote_payload,
            local_updated_at,
            remote_updated_at,
            detected_at,
            resolved_at: None,
            resolution: None,
        }
    }

    /// Returns true if the conflict still awaits an operator decision.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
