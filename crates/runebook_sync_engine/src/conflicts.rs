//! Durable log of open and resolved divergences.

use crate::store::{count_from, LocalStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use runebook_sync_protocol::{op_key, row_timestamp, Conflict, ConflictResolution, Row};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Durable log of divergences, keyed `table:id` like the outbox.
///
/// A resolved record for an entity is not history: the next divergence for
/// the same key reopens and overwrites it, so the table holds at most one
/// row per entity.
pub struct ConflictStore<S: LocalStore> {
    store: Arc<S>,
}

impl<S: LocalStore> ConflictStore<S> {
    /// Creates a conflict store over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Creates or refreshes the open record for the conflict's entity,
    /// clearing any stale resolution.
    pub fn upsert_conflict(&self, conflict: &Conflict) -> StoreResult<()> {
        info!(conflict_id = %conflict.conflict_id, "recording divergence");
        self.store.execute(
            "INSERT INTO sync_conflicts \
               (conflict_id, table_name, entity_id, local_payload, remote_payload, \
                local_updated_at, remote_updated_at, detected_at, resolved_at, resolution) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL) \
             ON CONFLICT(conflict_id) DO UPDATE SET \
               local_payload = excluded.local_payload, \
               remote_payload = excluded.remote_payload, \
               local_updated_at = excluded.local_updated_at, \
               remote_updated_at = excluded.remote_updated_at, \
               detected_at = excluded.detected_at, \
               resolved_at = NULL, \
               resolution = NULL",
            &[
                json!(conflict.conflict_id),
                json!(conflict.table),
                json!(conflict.entity_id),
                json!(Value::Object(conflict.local_payload.clone()).to_string()),
                json!(Value::Object(conflict.remote_payload.clone()).to_string()),
                timestamp_param(conflict.local_updated_at),
                timestamp_param(conflict.remote_updated_at),
                json!(conflict.detected_at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Stamps the open conflict for `table`/`entity_id` with a resolution.
    ///
    /// Returns false when no open conflict exists for the entity.
    pub fn resolve(
        &self,
        table: &str,
        entity_id: &str,
        resolution: ConflictResolution,
    ) -> StoreResult<bool> {
        let affected = self.store.execute(
            "UPDATE sync_conflicts SET resolved_at = ?1, resolution = ?2 \
             WHERE conflict_id = ?3 AND resolved_at IS NULL",
            &[
                json!(Utc::now().to_rfc3339()),
                json!(resolution.as_str()),
                json!(op_key(table, entity_id)),
            ],
        )?;
        debug!(
            table,
            entity_id,
            resolution = resolution.as_str(),
            resolved = affected > 0,
            "resolve conflict"
        );
        Ok(affected > 0)
    }

    /// Returns the open conflict for `table`/`entity_id`, if any.
    pub fn open_conflict(&self, table: &str, entity_id: &str) -> StoreResult<Option<Conflict>> {
        let rows = self.store.select(
            "SELECT * FROM sync_conflicts WHERE conflict_id = ?1 AND resolved_at IS NULL",
            &[json!(op_key(table, entity_id))],
        )?;
        rows.first().map(decode_conflict).transpose()
    }

    /// Returns true if `table`/`entity_id` has an open conflict.
    pub fn has_open_conflict(&self, table: &str, entity_id: &str) -> StoreResult<bool> {
        let rows = self.store.select(
            "SELECT 1 FROM sync_conflicts WHERE conflict_id = ?1 AND resolved_at IS NULL LIMIT 1",
            &[json!(op_key(table, entity_id))],
        )?;
        Ok(!rows.is_empty())
    }

    /// Returns every open conflict, oldest detection first.
    pub fn list_open(&self) -> StoreResult<Vec<Conflict>> {
        let rows = self.store.select(
            "SELECT * FROM sync_conflicts WHERE resolved_at IS NULL \
             ORDER BY detected_at ASC, conflict_id ASC",
            &[],
        )?;
        rows.iter().map(decode_conflict).collect()
    }

    /// Counts open conflicts.
    pub fn count_open(&self) -> StoreResult<u64> {
        let rows = self.store.select(
            "SELECT COUNT(*) AS n FROM sync_conflicts WHERE resolved_at IS NULL",
            &[],
        )?;
        count_from(&rows)
    }
}

fn timestamp_param(value: Option<DateTime<Utc>>) -> Value {
    match value {
        Some(ts) => json!(ts.to_rfc3339()),
        None => Value::Null,
    }
}

fn decode_conflict(row: &Row) -> StoreResult<Conflict> {
    let text = |field: &str| -> StoreResult<String> {
        row.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Corrupt(format!("conflict missing `{field}`")))
    };

    let payload = |field: &str| -> StoreResult<Row> {
        let raw: Value = serde_json::from_str(&text(field)?)
            .map_err(|e| StoreError::Corrupt(format!("conflict {field}: {e}")))?;
        raw.as_object()
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("conflict {field} is not an object")))
    };

    let resolution = match row.get("resolution") {
        Some(Value::String(tag)) => Some(
            ConflictResolution::parse(tag)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown resolution `{tag}`")))?,
        ),
        _ => None,
    };

    Ok(Conflict {
        conflict_id: text("conflict_id")?,
        table: text("table_name")?,
        entity_id: text("entity_id")?,
        local_payload: payload("local_payload")?,
        remote_payload: payload("remote_payload")?,
        local_updated_at: row_timestamp(row, "local_updated_at"),
        remote_updated_at: row_timestamp(row, "remote_updated_at"),
        detected_at: row_timestamp(row, "detected_at")
            .ok_or_else(|| StoreError::Corrupt("conflict missing `detected_at`".into()))?,
        resolved_at: row_timestamp(row, "resolved_at"),
        resolution,
    })
}
