//! Durable queue of pending local writes.

use crate::store::{count_from, LocalStore, StoreError, StoreResult};
use chrono::Utc;
use runebook_sync_protocol::{op_key, row_timestamp, OpKind, PendingOp, Row};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Durable log of not-yet-delivered local writes, one entry per entity.
///
/// Repeated writes to the same entity collapse into the latest payload
/// snapshot, so the queue is bounded by the number of edited entities, not
/// by the number of edits.
pub struct OutboxQueue<S: LocalStore> {
    store: Arc<S>,
}

impl<S: LocalStore> OutboxQueue<S> {
    /// Creates a queue over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Durably records a pending upsert for `table`/`entity_id`.
    ///
    /// Re-enqueueing overwrites the payload and refreshes `updated_at`;
    /// `created_at` is preserved so FIFO order follows the first enqueue.
    pub fn enqueue(&self, table: &str, entity_id: &str, payload: &Row) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let key = op_key(table, entity_id);
        debug!(op_id = %key, "enqueue pending op");
        self.store.execute(
            "INSERT INTO sync_pending_ops \
               (op_id, table_name, entity_id, op_kind, payload, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(op_id) DO UPDATE SET \
               payload = excluded.payload, updated_at = excluded.updated_at",
            &[
                json!(key),
                json!(table),
                json!(entity_id),
                json!(OpKind::Upsert.as_str()),
                json!(Value::Object(payload.clone()).to_string()),
                json!(now),
                json!(now),
            ],
        )?;
        Ok(())
    }

    /// Returns up to `limit` pending ops, oldest first enqueue first.
    pub fn list_pending(&self, limit: u32) -> StoreResult<Vec<PendingOp>> {
        let rows = self.store.select(
            "SELECT op_id, table_name, entity_id, op_kind, payload, created_at, updated_at \
             FROM sync_pending_ops ORDER BY created_at ASC, op_id ASC LIMIT ?1",
            &[json!(limit)],
        )?;
        rows.iter().map(decode_op).collect()
    }

    /// Returns true if a pending op exists for `table`/`entity_id`.
    pub fn has_pending_op(&self, table: &str, entity_id: &str) -> StoreResult<bool> {
        let rows = self.store.select(
            "SELECT 1 FROM sync_pending_ops WHERE op_id = ?1 LIMIT 1",
            &[json!(op_key(table, entity_id))],
        )?;
        Ok(!rows.is_empty())
    }

    /// Removes a delivered or superseded op.
    pub fn delete_op(&self, op_id: &str) -> StoreResult<()> {
        self.store.execute(
            "DELETE FROM sync_pending_ops WHERE op_id = ?1",
            &[json!(op_id)],
        )?;
        Ok(())
    }

    /// Returns the number of pending ops.
    pub fn pending_count(&self) -> StoreResult<u64> {
        let rows = self
            .store
            .select("SELECT COUNT(*) AS n FROM sync_pending_ops", &[])?;
        count_from(&rows)
    }
}

fn decode_op(row: &Row) -> StoreResult<PendingOp> {
    let text = |field: &str| -> StoreResult<String> {
        row.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Corrupt(format!("pending op missing `{field}`")))
    };

    let payload_text = text("payload")?;
    let payload: Value = serde_json::from_str(&payload_text)
        .map_err(|e| StoreError::Corrupt(format!("pending op payload: {e}")))?;
    let payload = payload
        .as_object()
        .cloned()
        .ok_or_else(|| StoreError::Corrupt("pending op payload is not an object".into()))?;

    let kind_tag = text("op_kind")?;
    let kind = OpKind::parse(&kind_tag)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown op kind `{kind_tag}`")))?;

    let created_at = row_timestamp(row, "created_at")
        .ok_or_else(|| StoreError::Corrupt("pending op missing `created_at`".into()))?;
    let updated_at = row_timestamp(row, "updated_at")
        .ok_or_else(|| StoreError::Corrupt("pending op missing `updated_at`".into()))?;

    Ok(PendingOp {
        op_id: text("op_id")?,
        table: text("table_name")?,
        entity_id: text("entity_id")?,
        kind,
        payload,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ensure_sync_tables, SqliteStore};
    use serde_json::json;

    fn queue() -> OutboxQueue<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        ensure_sync_tables(&store).unwrap();
        OutboxQueue::new(Arc::new(store))
    }

    fn payload(name: &str) -> Row {
        json!({"id": "c1", "name": name})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn enqueue_twice_collapses_to_latest_payload() {
        let outbox = queue();
        outbox.enqueue("characters", "c1", &payload("Sable")).unwrap();
        let first = outbox.list_pending(10).unwrap().remove(0);

        outbox
            .enqueue("characters", "c1", &payload("Sable the Grey"))
            .unwrap();
        let pending = outbox.list_pending(10).unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["name"], json!("Sable the Grey"));
        assert_eq!(pending[0].created_at, first.created_at);
        assert!(pending[0].updated_at >= first.updated_at);
    }

    #[test]
    fn list_pending_is_fifo_and_bounded() {
        let outbox = queue();
        outbox.enqueue("characters", "a", &payload("A")).unwrap();
        outbox.enqueue("characters", "b", &payload("B")).unwrap();
        outbox.enqueue("encounters", "c", &payload("C")).unwrap();

        let all = outbox.list_pending(10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].op_id, "characters:a");

        let bounded = outbox.list_pending(2).unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn has_and_delete() {
        let outbox = queue();
        outbox.enqueue("characters", "c1", &payload("Sable")).unwrap();

        assert!(outbox.has_pending_op("characters", "c1").unwrap());
        assert!(!outbox.has_pending_op("characters", "c2").unwrap());
        assert!(!outbox.has_pending_op("encounters", "c1").unwrap());

        outbox.delete_op("characters:c1").unwrap();
        assert!(!outbox.has_pending_op("characters", "c1").unwrap());
        assert_eq!(outbox.pending_count().unwrap(), 0);
    }

    #[test]
    fn deleting_missing_op_is_a_no_op() {
        let outbox = queue();
        outbox.delete_op("characters:ghost").unwrap();
        assert_eq!(outbox.pending_count().unwrap(), 0);
    }
}
