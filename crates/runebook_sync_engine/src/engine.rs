//! Push and pull algorithms.

use crate::config::SyncConfig;
use crate::conflicts::ConflictStore;
use crate::error::{SyncError, SyncResult};
use crate::outbox::OutboxQueue;
use crate::registry::{EntitySpec, TableRegistry};
use crate::remote::{RemoteClient, Session};
use crate::resolution::ResolutionService;
use crate::store::{ensure_sync_tables, LocalStore, StoreResult};
use crate::sync_state::SyncStateStore;
use chrono::Utc;
use runebook_sync_protocol::{requires_resolution, row_id, row_timestamp, Conflict, Row, UPDATED_AT};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a push call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Ops delivered and removed from the queue.
    pub pushed: u64,
    /// Ops held back because their entity has an open conflict.
    pub skipped_conflicted: u64,
}

/// Result of a pull call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Remote rows applied locally.
    pub applied: u64,
    /// Divergences recorded for operator resolution.
    pub conflicts_raised: u64,
    /// Rows skipped because their entity already has an open conflict.
    pub skipped_conflicted: u64,
    /// Rows skipped because the local row was strictly newer (stale
    /// re-delivery).
    pub skipped_stale: u64,
    /// Rows dropped by the table's inclusion predicate or for a missing
    /// primary key.
    pub filtered: u64,
}

/// The sync engine: push and pull over a remote client and a local store.
///
/// Ops and rows are processed strictly sequentially within a call to keep
/// partial-failure semantics simple and auditable; scheduling and
/// re-entrancy are the orchestrator's concern.
pub struct SyncEngine<R: RemoteClient, S: LocalStore> {
    config: SyncConfig,
    registry: Arc<TableRegistry>,
    remote: Arc<R>,
    store: Arc<S>,
    outbox: OutboxQueue<S>,
    conflicts: ConflictStore<S>,
    state: SyncStateStore<S>,
    resolution: ResolutionService<S>,
}

impl<R: RemoteClient, S: LocalStore> SyncEngine<R, S> {
    /// Creates an engine, ensuring the sync bookkeeping tables exist.
    pub fn new(
        config: SyncConfig,
        registry: TableRegistry,
        remote: Arc<R>,
        store: Arc<S>,
    ) -> SyncResult<Self> {
        ensure_sync_tables(store.as_ref())?;
        let registry = Arc::new(registry);
        Ok(Self {
            config,
            registry: Arc::clone(&registry),
            remote,
            outbox: OutboxQueue::new(Arc::clone(&store)),
            conflicts: ConflictStore::new(Arc::clone(&store)),
            state: SyncStateStore::new(Arc::clone(&store)),
            resolution: ResolutionService::new(registry, Arc::clone(&store)),
            store,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the table registry.
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Returns the remote client.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns the outbox queue.
    pub fn outbox(&self) -> &OutboxQueue<S> {
        &self.outbox
    }

    /// Returns the conflict store.
    pub fn conflicts(&self) -> &ConflictStore<S> {
        &self.conflicts
    }

    /// Returns the sync-state singleton.
    pub fn sync_state(&self) -> &SyncStateStore<S> {
        &self.state
    }

    /// Returns the resolution service.
    pub fn resolution(&self) -> &ResolutionService<S> {
        &self.resolution
    }

    /// Records a local write to a synced entity, queueing it for delivery.
    ///
    /// # Panics
    ///
    /// Panics if `table` is not registered.
    pub fn enqueue_local_write(&self, table: &str, entity_id: &str, payload: &Row) -> SyncResult<()> {
        let spec = self.registry.spec(table);
        self.outbox.enqueue(spec.table(), entity_id, payload)?;
        Ok(())
    }

    fn require_session(&self) -> SyncResult<Session> {
        match self.remote.session()? {
            Some(session) => Ok(session),
            None => Err(SyncError::NotSignedIn),
        }
    }

    /// Delivers a bounded, oldest-first batch of pending ops to the remote
    /// store.
    ///
    /// Entities with an open conflict are held back until resolved. A remote
    /// failure aborts the remainder of the batch with the remote message
    /// passed through verbatim; ops already delivered stay deleted (upserts
    /// are idempotent, so partial progress is durable and the rest retry on
    /// the next push).
    pub fn push(&self) -> SyncResult<PushReport> {
        self.require_session()?;

        let batch = self.outbox.list_pending(self.config.push_batch_size)?;
        let mut report = PushReport::default();
        for op in &batch {
            if self.conflicts.has_open_conflict(&op.table, &op.entity_id)? {
                debug!(op_id = %op.op_id, "holding back conflicted entity");
                report.skipped_conflicted += 1;
                continue;
            }
            let spec = self.registry.spec(&op.table);
            let payload = spec.normalized_payload(&op.payload);
            self.remote.upsert(spec.table(), &payload, spec.primary_key())?;
            self.outbox.delete_op(&op.op_id)?;
            report.pushed += 1;
        }

        self.state.record_pushed_at(Utc::now())?;
        info!(
            pushed = report.pushed,
            skipped = report.skipped_conflicted,
            "push complete"
        );
        Ok(report)
    }

    /// Fetches and applies remote deltas for every registered table.
    ///
    /// Rows are fetched against a single global watermark (the last
    /// successful pull time) and the pull's own invocation time becomes the
    /// new watermark: rows committed remotely mid-pull may be re-fetched
    /// next cycle, which idempotent upserts make harmless.
    pub fn pull(&self) -> SyncResult<PullReport> {
        self.require_session()?;

        let started_at = Utc::now();
        let watermark = self.state.last_pulled_at()?;
        let mut report = PullReport::default();

        for spec in self.registry.specs() {
            let rows = self.remote.changed_since(
                spec.table(),
                spec.columns(),
                watermark,
                self.config.pull_batch_size,
            )?;
            debug!(table = spec.table(), rows = rows.len(), "pulled deltas");
            for row in &rows {
                self.reconcile_remote_row(spec, row, &mut report)?;
            }
        }

        self.state.record_pulled_at(started_at)?;
        info!(
            applied = report.applied,
            conflicts = report.conflicts_raised,
            "pull complete"
        );
        Ok(report)
    }

    /// Applies one incoming remote row, or records a divergence.
    fn reconcile_remote_row(
        &self,
        spec: &EntitySpec,
        row: &Row,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        if !spec.includes(row) {
            report.filtered += 1;
            return Ok(());
        }
        let Some(entity_id) = row_id(row, spec.primary_key()) else {
            warn!(table = spec.table(), "dropping remote row with no usable primary key");
            report.filtered += 1;
            return Ok(());
        };

        // An outstanding divergence freezes the entity until resolved.
        if self.conflicts.has_open_conflict(spec.table(), &entity_id)? {
            report.skipped_conflicted += 1;
            return Ok(());
        }

        // The local row's own stored timestamp decides, not the pending-op
        // snapshot.
        let local_row = self.load_local_row(spec, &entity_id)?;
        let local_updated_at = local_row
            .as_ref()
            .and_then(|row| row_timestamp(row, UPDATED_AT));
        let remote_updated_at = row_timestamp(row, UPDATED_AT);
        let has_pending = self.outbox.has_pending_op(spec.table(), &entity_id)?;

        if requires_resolution(has_pending, local_updated_at, remote_updated_at) {
            let local_payload = local_row.unwrap_or_else(|| {
                let mut stub = Row::new();
                stub.insert(spec.primary_key().to_string(), json!(entity_id));
                stub
            });
            let conflict = Conflict::open(
                spec.table(),
                &entity_id,
                local_payload,
                row.clone(),
                local_updated_at,
                remote_updated_at,
                Utc::now(),
            );
            self.conflicts.upsert_conflict(&conflict)?;
            self.state
                .set_open_conflict_count(self.conflicts.count_open()?)?;
            report.conflicts_raised += 1;
            return Ok(());
        }

        if !has_pending {
            if let (Some(local), Some(remote)) = (local_updated_at, remote_updated_at) {
                if local > remote {
                    debug!(
                        table = spec.table(),
                        entity_id = %entity_id,
                        "ignoring stale remote re-delivery"
                    );
                    report.skipped_stale += 1;
                    return Ok(());
                }
            }
        }

        apply_row(self.store.as_ref(), spec, row)?;
        report.applied += 1;
        Ok(())
    }

    fn load_local_row(&self, spec: &EntitySpec, entity_id: &str) -> StoreResult<Option<Row>> {
        let query = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            spec.columns().join(", "),
            spec.table(),
            spec.primary_key()
        );
        let rows = self.store.select(&query, &[json!(entity_id)])?;
        Ok(rows.into_iter().next())
    }
}

/// Runs the table's idempotent upsert with the row's values.
pub(crate) fn apply_row<S: LocalStore>(
    store: &S,
    spec: &EntitySpec,
    row: &Row,
) -> StoreResult<()> {
    let normalized = spec.normalized_payload(row);
    store.execute(&spec.upsert_statement(), &spec.bind_values(&normalized))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::store::SqliteStore;
    use serde_json::json;

    fn registry() -> TableRegistry {
        TableRegistry::new(vec![
            EntitySpec::new(
                "characters",
                "id",
                &["id", "name", "sheet", "updated_at", "created_at"],
            ),
            EntitySpec::new(
                "app_state",
                "key",
                &["key", "value", "updated_at", "created_at"],
            )
            .with_include(|row| {
                row.get("key").and_then(|v| v.as_str()) == Some("campaign_prefs")
            }),
        ])
    }

    fn fixture_store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE characters (
                   id TEXT PRIMARY KEY, name TEXT, sheet TEXT, updated_at TEXT, created_at TEXT
                 )",
                &[],
            )
            .unwrap();
        store
            .execute(
                "CREATE TABLE app_state (
                   key TEXT PRIMARY KEY, value TEXT, updated_at TEXT, created_at TEXT
                 )",
                &[],
            )
            .unwrap();
        Arc::new(store)
    }

    fn engine(remote: Arc<MockRemote>) -> SyncEngine<MockRemote, SqliteStore> {
        SyncEngine::new(SyncConfig::new(), registry(), remote, fixture_store()).unwrap()
    }

    fn character(id: &str, name: &str, updated_at: &str) -> Row {
        json!({
            "id": id,
            "name": name,
            "sheet": "{}",
            "updated_at": updated_at,
            "created_at": "2024-01-01T00:00:00Z",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn push_requires_session() {
        let engine = engine(Arc::new(MockRemote::new()));
        let err = engine.push().unwrap_err();
        assert!(matches!(err, SyncError::NotSignedIn));
        assert!(err.is_offline());
    }

    #[test]
    fn push_delivers_and_empties_queue() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        engine
            .enqueue_local_write("characters", "c1", &character("c1", "Sable", "2024-03-01T00:00:00Z"))
            .unwrap();

        let report = engine.push().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.outbox().pending_count().unwrap(), 0);

        let upserts = remote.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].0, "characters");
        assert_eq!(upserts[0].1["name"], json!("Sable"));
        assert!(engine.sync_state().last_pushed_at().unwrap().is_some());
    }

    #[test]
    fn push_normalizes_missing_fields_to_null() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        let sparse = json!({"id": "c1", "name": "Sable"})
            .as_object()
            .unwrap()
            .clone();
        engine.enqueue_local_write("characters", "c1", &sparse).unwrap();

        engine.push().unwrap();
        let (_, row) = remote.upserts().remove(0);
        assert_eq!(row["sheet"], serde_json::Value::Null);
        assert_eq!(row["updated_at"], serde_json::Value::Null);
        assert_eq!(row.len(), 5);
    }

    #[test]
    fn push_skips_conflicted_entity() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        engine
            .enqueue_local_write("characters", "c1", &character("c1", "Sable", "2024-03-01T00:00:00Z"))
            .unwrap();
        let conflict = Conflict::open(
            "characters",
            "c1",
            Row::new(),
            Row::new(),
            None,
            None,
            Utc::now(),
        );
        engine.conflicts().upsert_conflict(&conflict).unwrap();

        let report = engine.push().unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.skipped_conflicted, 1);
        assert!(remote.upserts().is_empty());
        assert!(engine.outbox().has_pending_op("characters", "c1").unwrap());
        // The batch still stamps a push time.
        assert!(engine.sync_state().last_pushed_at().unwrap().is_some());
    }

    #[test]
    fn push_aborts_batch_on_remote_error_keeping_partial_progress() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        engine
            .enqueue_local_write("characters", "a", &character("a", "A", "2024-03-01T00:00:00Z"))
            .unwrap();
        engine
            .enqueue_local_write("characters", "b", &character("b", "B", "2024-03-01T00:00:00Z"))
            .unwrap();

        // First upsert succeeds, second fails mid-batch.
        remote.set_upsert_error_after(1, "row-level security violation");

        let err = engine.push().unwrap_err();
        assert_eq!(err.remote_message(), Some("row-level security violation"));

        // The delivered op stays deleted; the rest of the batch survives to
        // retry on the next push.
        assert_eq!(remote.upserts().len(), 1);
        assert!(!engine.outbox().has_pending_op("characters", "a").unwrap());
        assert!(engine.outbox().has_pending_op("characters", "b").unwrap());
        // The aborted batch does not stamp a push time.
        assert!(engine.sync_state().last_pushed_at().unwrap().is_none());

        remote.clear_upsert_error();
        let report = engine.push().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.outbox().pending_count().unwrap(), 0);
    }

    #[test]
    fn pull_applies_remote_rows_and_advances_watermark() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        remote.set_rows(
            "characters",
            vec![character("c1", "Sable", "2024-03-01T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.applied, 1);
        assert!(engine.sync_state().last_pulled_at().unwrap().is_some());

        let rows = engine
            .store
            .select("SELECT * FROM characters", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Sable"));

        // Second pull sees nothing new: the watermark moved past the row.
        let report = engine.pull().unwrap();
        assert_eq!(report.applied, 0);
    }

    #[test]
    fn pull_raises_conflict_for_racing_local_edit() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));

        // Local row at T1 with a queued edit.
        apply_row(
            engine.store.as_ref(),
            engine.registry().spec("characters"),
            &character("c1", "Sable", "2024-03-01T00:00:00Z"),
        )
        .unwrap();
        engine
            .enqueue_local_write("characters", "c1", &character("c1", "Sable (edited)", "2024-03-01T00:00:00Z"))
            .unwrap();

        // Remote row at T2 > T1.
        remote.set_rows(
            "characters",
            vec![character("c1", "Sable the Grey", "2024-03-02T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.conflicts_raised, 1);
        assert_eq!(report.applied, 0);

        // Local row and pending op are untouched.
        let rows = engine.store.select("SELECT name FROM characters", &[]).unwrap();
        assert_eq!(rows[0]["name"], json!("Sable"));
        assert!(engine.outbox().has_pending_op("characters", "c1").unwrap());

        let open = engine
            .conflicts()
            .open_conflict("characters", "c1")
            .unwrap()
            .unwrap();
        assert_eq!(open.local_payload["name"], json!("Sable"));
        assert_eq!(open.remote_payload["name"], json!("Sable the Grey"));
        assert_eq!(engine.sync_state().open_conflict_count().unwrap(), 1);
    }

    #[test]
    fn pull_conflicts_when_local_row_missing_but_op_pending() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        engine
            .enqueue_local_write("characters", "c1", &character("c1", "Sable", "2024-03-01T00:00:00Z"))
            .unwrap();
        remote.set_rows(
            "characters",
            vec![character("c1", "Remote Sable", "2024-03-02T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.conflicts_raised, 1);

        // The local snapshot is a stub keyed by id.
        let open = engine
            .conflicts()
            .open_conflict("characters", "c1")
            .unwrap()
            .unwrap();
        assert_eq!(open.local_payload["id"], json!("c1"));
        assert_eq!(open.local_updated_at, None);
    }

    #[test]
    fn pull_skips_entity_with_open_conflict() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        let conflict = Conflict::open(
            "characters",
            "c1",
            Row::new(),
            Row::new(),
            None,
            None,
            Utc::now(),
        );
        engine.conflicts().upsert_conflict(&conflict).unwrap();
        remote.set_rows(
            "characters",
            vec![character("c1", "Sable", "2024-03-02T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.skipped_conflicted, 1);
        assert_eq!(report.applied, 0);
        let rows = engine.store.select("SELECT * FROM characters", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn pull_without_pending_op_applies_remote() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        apply_row(
            engine.store.as_ref(),
            engine.registry().spec("characters"),
            &character("c1", "Old", "2024-03-01T00:00:00Z"),
        )
        .unwrap();
        remote.set_rows(
            "characters",
            vec![character("c1", "New", "2024-03-02T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.applied, 1);
        let rows = engine.store.select("SELECT name FROM characters", &[]).unwrap();
        assert_eq!(rows[0]["name"], json!("New"));
    }

    #[test]
    fn pull_ignores_stale_remote_redelivery() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        apply_row(
            engine.store.as_ref(),
            engine.registry().spec("characters"),
            &character("c1", "Current", "2024-03-05T00:00:00Z"),
        )
        .unwrap();
        remote.set_rows(
            "characters",
            vec![character("c1", "Older", "2024-03-02T00:00:00Z")],
        );

        let report = engine.pull().unwrap();
        assert_eq!(report.skipped_stale, 1);
        let rows = engine.store.select("SELECT name FROM characters", &[]).unwrap();
        assert_eq!(rows[0]["name"], json!("Current"));
    }

    #[test]
    fn pull_honors_inclusion_predicate() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        let prefs = json!({
            "key": "campaign_prefs",
            "value": "{\"theme\":\"dark\"}",
            "updated_at": "2024-03-01T00:00:00Z",
            "created_at": "2024-01-01T00:00:00Z",
        })
        .as_object()
        .unwrap()
        .clone();
        let local_only = json!({
            "key": "window_geometry",
            "value": "800x600",
            "updated_at": "2024-03-01T00:00:00Z",
            "created_at": "2024-01-01T00:00:00Z",
        })
        .as_object()
        .unwrap()
        .clone();
        remote.set_rows("app_state", vec![prefs, local_only]);

        let report = engine.pull().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.filtered, 1);
        let rows = engine.store.select("SELECT key FROM app_state", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["key"], json!("campaign_prefs"));
    }

    #[test]
    fn pull_drops_rows_without_primary_key() {
        let remote = Arc::new(MockRemote::signed_in("gm"));
        let engine = engine(Arc::clone(&remote));
        let mut row = character("c1", "Sable", "2024-03-01T00:00:00Z");
        row.insert("id".into(), serde_json::Value::Null);
        remote.set_rows("characters", vec![row]);

        let report = engine.pull().unwrap();
        assert_eq!(report.filtered, 1);
        assert_eq!(report.applied, 0);
    }
}
