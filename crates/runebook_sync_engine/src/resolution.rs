//! Operator-driven conflict resolution.

use crate::conflicts::ConflictStore;
use crate::engine::apply_row;
use crate::outbox::OutboxQueue;
use crate::registry::TableRegistry;
use crate::store::LocalStore;
use crate::sync_state::SyncStateStore;
use crate::SyncResult;
use runebook_sync_protocol::{op_key, ConflictResolution};
use std::sync::Arc;
use tracing::info;

/// What a resolution call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// An open conflict existed and was resolved.
    Resolved,
    /// No open conflict existed for the entity; nothing was changed.
    ///
    /// This is a successful idempotent no-op rather than an error:
    /// resolution requests race pulls by design, so an operator acting on a
    /// stale conflict list must not fail.
    NoOpenConflict,
}

/// Applies an operator's decision to a recorded divergence.
pub struct ResolutionService<S: LocalStore> {
    registry: Arc<TableRegistry>,
    store: Arc<S>,
    outbox: OutboxQueue<S>,
    conflicts: ConflictStore<S>,
    state: SyncStateStore<S>,
}

impl<S: LocalStore> ResolutionService<S> {
    /// Creates a resolution service over the given registry and store.
    pub fn new(registry: Arc<TableRegistry>, store: Arc<S>) -> Self {
        Self {
            registry,
            outbox: OutboxQueue::new(Arc::clone(&store)),
            conflicts: ConflictStore::new(Arc::clone(&store)),
            state: SyncStateStore::new(Arc::clone(&store)),
            store,
        }
    }

    /// Accepts the remote side of the divergence.
    ///
    /// The stored remote payload overwrites the local row via the table's
    /// upsert, any pending local op is superseded and deleted, and the
    /// conflict is stamped `keep_remote`.
    pub fn keep_remote_for_conflict(
        &self,
        table: &str,
        entity_id: &str,
    ) -> SyncResult<ResolutionOutcome> {
        let Some(conflict) = self.conflicts.open_conflict(table, entity_id)? else {
            return Ok(ResolutionOutcome::NoOpenConflict);
        };

        let spec = self.registry.spec(table);
        apply_row(self.store.as_ref(), spec, &conflict.remote_payload)?;
        self.outbox.delete_op(&op_key(table, entity_id))?;
        self.conflicts
            .resolve(table, entity_id, ConflictResolution::KeepRemote)?;
        self.state
            .set_open_conflict_count(self.conflicts.count_open()?)?;
        info!(table, entity_id, "conflict resolved: kept remote");
        Ok(ResolutionOutcome::Resolved)
    }

    /// Keeps the queued local edit.
    ///
    /// The conflict is stamped `keep_local`; the pending op stays queued and
    /// is unblocked for delivery on the next push cycle. (The orchestrator
    /// wrapper schedules that push immediately.)
    pub fn keep_local_for_conflict(
        &self,
        table: &str,
        entity_id: &str,
    ) -> SyncResult<ResolutionOutcome> {
        let resolved = self
            .conflicts
            .resolve(table, entity_id, ConflictResolution::KeepLocal)?;
        if !resolved {
            return Ok(ResolutionOutcome::NoOpenConflict);
        }
        self.state
            .set_open_conflict_count(self.conflicts.count_open()?)?;
        info!(table, entity_id, "conflict resolved: kept local");
        Ok(ResolutionOutcome::Resolved)
    }
}
