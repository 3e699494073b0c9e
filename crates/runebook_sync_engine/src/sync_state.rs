//! Singleton sync-state record.

use crate::store::{count_from, LocalStore, StoreResult};
use chrono::{DateTime, Utc};
use runebook_sync_protocol::row_timestamp;
use serde_json::json;
use std::sync::Arc;

/// The singleton sync-state row: watermarks plus a cached open-conflict
/// count.
///
/// The count is a denormalized convenience for status surfaces; callers that
/// mutate the conflict table recompute it from a full count rather than
/// incrementing, so it can never drift.
pub struct SyncStateStore<S: LocalStore> {
    store: Arc<S>,
}

impl<S: LocalStore> SyncStateStore<S> {
    /// Creates a state store over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the last successful pull time — the pull watermark.
    ///
    /// The watermark is a single global timestamp shared across all tables,
    /// not a per-table cursor: a table registered after the first pull will
    /// only receive rows updated after the current watermark. Idempotent
    /// upserts make any redundant re-fetch around the boundary harmless.
    pub fn last_pulled_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.timestamp_field("last_pulled_at")
    }

    /// Returns the last successful push time.
    pub fn last_pushed_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.timestamp_field("last_pushed_at")
    }

    /// Records a successful pull at `at`.
    pub fn record_pulled_at(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.execute(
            "UPDATE sync_state SET last_pulled_at = ?1 WHERE id = 1",
            &[json!(at.to_rfc3339())],
        )?;
        Ok(())
    }

    /// Records a successful push at `at`.
    pub fn record_pushed_at(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.execute(
            "UPDATE sync_state SET last_pushed_at = ?1 WHERE id = 1",
            &[json!(at.to_rfc3339())],
        )?;
        Ok(())
    }

    /// Returns the cached open-conflict count.
    pub fn open_conflict_count(&self) -> StoreResult<u64> {
        let rows = self
            .store
            .select("SELECT open_conflict_count AS n FROM sync_state WHERE id = 1", &[])?;
        count_from(&rows)
    }

    /// Replaces the cached open-conflict count with a freshly computed one.
    pub fn set_open_conflict_count(&self, count: u64) -> StoreResult<()> {
        self.store.execute(
            "UPDATE sync_state SET open_conflict_count = ?1 WHERE id = 1",
            &[json!(count)],
        )?;
        Ok(())
    }

    fn timestamp_field(&self, field: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let rows = self
            .store
            .select("SELECT last_pulled_at, last_pushed_at FROM sync_state WHERE id = 1", &[])?;
        Ok(rows.first().and_then(|row| row_timestamp(row, field)))
    }
}
