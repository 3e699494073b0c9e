//! Sync orchestration: status, scheduling, and sign-in triggers.

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::remote::{Credentials, RemoteClient, Session};
use crate::resolution::ResolutionOutcome;
use crate::store::LocalStore;
use parking_lot::{Mutex, RwLock};
use runebook_sync_protocol::Conflict;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Coarse sync status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Remote unreachable, unconfigured, or signed out.
    Offline,
    /// Connected and quiet.
    Idle,
    /// A push or pull cycle is running.
    Syncing,
    /// The last cycle failed with a non-offline error.
    Error,
}

/// A status change broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// The new status.
    pub status: SyncStatus,
    /// Optional human-readable detail (e.g. the verbatim remote message).
    pub message: Option<String>,
}

/// Owns the status state machine and all sync scheduling.
///
/// Construct one per local store via [`SyncOrchestrator::new`]; there is no
/// process-wide singleton, so tests and multi-profile apps can run several
/// independent instances. All timer methods must be called inside a tokio
/// runtime.
///
/// A single async gate serializes push/pull cycles: two invocations can
/// never interleave against the same watermark. In-flight remote calls are
/// not cancellable; [`schedule_push`](Self::schedule_push) only cancels
/// timers that have not yet fired.
pub struct SyncOrchestrator<R: RemoteClient + 'static, S: LocalStore + 'static> {
    engine: SyncEngine<R, S>,
    // Handle to ourselves for the timer tasks we spawn. Always upgradable
    // while a caller holds the Arc this method was invoked through.
    weak: Weak<Self>,
    current: RwLock<StatusEvent>,
    events: broadcast::Sender<StatusEvent>,
    pending_push: Mutex<Option<JoinHandle<()>>>,
    pull_timer: Mutex<Option<JoinHandle<()>>>,
    sync_gate: tokio::sync::Mutex<()>,
}

impl<R: RemoteClient + 'static, S: LocalStore + 'static> SyncOrchestrator<R, S> {
    /// Creates an orchestrator over the given engine, initially offline.
    pub fn new(engine: SyncEngine<R, S>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            engine,
            weak: weak.clone(),
            current: RwLock::new(StatusEvent {
                status: SyncStatus::Offline,
                message: None,
            }),
            events,
            pending_push: Mutex::new(None),
            pull_timer: Mutex::new(None),
            sync_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the engine, for enqueueing writes and reading queue state.
    pub fn engine(&self) -> &SyncEngine<R, S> {
        &self.engine
    }

    /// Returns the current status.
    pub fn status(&self) -> StatusEvent {
        self.current.read().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Probes remote availability, runs the startup sync, and arms the
    /// periodic pull timer.
    ///
    /// With an active session the startup sync is a pull followed by a push
    /// only if local ops are pending. Without one the status goes offline;
    /// the pull timer still runs so a later sign-in starts syncing without
    /// a restart.
    pub async fn start(&self) {
        match self.engine.remote().session() {
            Ok(Some(_)) => {
                self.full_sync().await;
            }
            Ok(None) => self.set_status(SyncStatus::Offline, Some("no active session".into())),
            Err(error) => self.note_failure(&error),
        }
        self.arm_pull_timer();
    }

    /// Coalesces bursts of local writes into one delayed push.
    ///
    /// Trailing-edge debounce: each call cancels any not-yet-fired timer and
    /// arms a fresh one, so exactly one timer is ever live.
    pub fn schedule_push(&self, debounce: Duration) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let mut slot = self.pending_push.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        debug!(debounce_ms = debounce.as_millis() as u64, "arming push timer");
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // The timer has fired: later schedule_push calls arm a fresh
            // timer instead of cancelling this push mid-flight.
            this.pending_push.lock().take();
            this.push_cycle().await;
        }));
    }

    /// Runs an immediate push followed by a pull.
    pub async fn sync_now(&self) -> SyncResult<()> {
        let _gate = self.sync_gate.lock().await;
        self.set_status(SyncStatus::Syncing, None);
        let result = self
            .engine
            .push()
            .and_then(|_| self.engine.pull())
            .map(|_| ());
        match &result {
            Ok(()) => self.set_status(SyncStatus::Idle, None),
            Err(error) => self.note_failure(error),
        }
        result
    }

    /// Signs in and, on success, runs a full sync.
    pub async fn sign_in(&self, credentials: &Credentials) -> SyncResult<Session> {
        match self.engine.remote().sign_in(credentials) {
            Ok(session) => {
                self.full_sync().await;
                Ok(session)
            }
            Err(error) => {
                self.note_failure(&error);
                Err(error)
            }
        }
    }

    /// Signs out and goes offline. Queued local writes survive for the next
    /// session.
    pub async fn sign_out(&self) -> SyncResult<()> {
        self.engine.remote().sign_out()?;
        self.set_status(SyncStatus::Offline, Some("signed out".into()));
        Ok(())
    }

    /// Returns every open conflict, oldest first.
    pub fn open_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.engine.conflicts().list_open()?)
    }

    /// Resolves a conflict by accepting the remote side.
    pub fn keep_remote_for_conflict(
        &self,
        table: &str,
        entity_id: &str,
    ) -> SyncResult<ResolutionOutcome> {
        self.engine.resolution().keep_remote_for_conflict(table, entity_id)
    }

    /// Resolves a conflict by keeping the local edit and schedules an
    /// immediate push so the now-unblocked op delivers.
    pub fn keep_local_for_conflict(
        &self,
        table: &str,
        entity_id: &str,
    ) -> SyncResult<ResolutionOutcome> {
        let outcome = self.engine.resolution().keep_local_for_conflict(table, entity_id)?;
        if outcome == ResolutionOutcome::Resolved {
            self.schedule_push(Duration::ZERO);
        }
        Ok(outcome)
    }

    /// Cancels the pull timer and any pending debounced push.
    pub fn shutdown(&self) {
        if let Some(handle) = self.pending_push.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.pull_timer.lock().take() {
            handle.abort();
        }
    }

    /// Pull, then push only if local ops are pending.
    async fn full_sync(&self) {
        let _gate = self.sync_gate.lock().await;
        self.set_status(SyncStatus::Syncing, None);
        let result = self.engine.pull().map(|_| ()).and_then(|()| {
            if self.engine.outbox().pending_count()? > 0 {
                self.engine.push().map(|_| ())
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => self.set_status(SyncStatus::Idle, None),
            Err(error) => self.note_failure(&error),
        }
    }

    async fn push_cycle(&self) {
        let _gate = self.sync_gate.lock().await;
        self.set_status(SyncStatus::Syncing, None);
        match self.engine.push() {
            Ok(_) => self.set_status(SyncStatus::Idle, None),
            Err(error) => self.note_failure(&error),
        }
    }

    async fn pull_cycle(&self) {
        let _gate = self.sync_gate.lock().await;
        self.set_status(SyncStatus::Syncing, None);
        match self.engine.pull() {
            Ok(_) => self.set_status(SyncStatus::Idle, None),
            Err(error) => self.note_failure(&error),
        }
    }

    fn arm_pull_timer(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let mut slot = self.pull_timer.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let interval = self.engine.config().pull_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the startup sync already
            // covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.pull_cycle().await;
            }
        }));
    }

    fn set_status(&self, status: SyncStatus, message: Option<String>) {
        let event = StatusEvent { status, message };
        *self.current.write() = event.clone();
        // Subscribers may have gone away; that is not our problem.
        let _ = self.events.send(event);
    }

    fn note_failure(&self, error: &SyncError) {
        if error.is_offline() {
            debug!(%error, "sync unavailable");
            self.set_status(SyncStatus::Offline, Some(error.to_string()));
        } else {
            warn!(%error, "sync failed");
            let message = error
                .remote_message()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.set_status(SyncStatus::Error, Some(message));
        }
    }
}
