//! # Runebook Sync Engine
//!
//! Offline-first push/pull sync engine and orchestrator for Runebook.
//!
//! This crate provides:
//! - Table registry (per-entity schema and upsert generation)
//! - Durable outbox queue, conflict store, and sync-state singleton
//! - Push and pull algorithms over a remote-client abstraction
//! - Operator-driven conflict resolution
//! - Orchestrator (status state machine, debounced/periodic scheduling)
//!
//! ## Architecture
//!
//! Every local write to a synced entity enqueues a pending op; a debounced
//! push delivers non-conflicted ops to the remote store and removes them on
//! confirmation. A periodic or on-demand pull fetches remote rows changed
//! since the last successful pull, applying them locally — or, where a local
//! edit races a strictly newer remote edit, opening a conflict instead of
//! overwriting.
//!
//! ## Key Invariants
//!
//! - Upserts are idempotent on both sides, so partial progress is safe
//! - An entity with an open conflict is skipped by both push and pull until
//!   an operator resolves it
//! - Ops and rows are processed strictly sequentially within a call
//! - One process owns the local store; a re-entrancy gate in the
//!   orchestrator keeps push/pull cycles from interleaving

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflicts;
mod engine;
mod error;
mod orchestrator;
mod outbox;
mod registry;
mod remote;
mod resolution;
mod store;
mod sync_state;

pub use config::SyncConfig;
pub use conflicts::ConflictStore;
pub use engine::{PullReport, PushReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{StatusEvent, SyncOrchestrator, SyncStatus};
pub use outbox::OutboxQueue;
pub use registry::{EntitySpec, TableRegistry};
pub use remote::{Credentials, MockRemote, RemoteClient, Session};
pub use resolution::{ResolutionOutcome, ResolutionService};
pub use store::{ensure_sync_tables, LocalStore, SqliteStore, StoreError, StoreResult};
pub use sync_state::SyncStateStore;
