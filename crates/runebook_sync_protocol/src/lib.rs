//! # Runebook Sync Protocol
//!
//! Sync record types and conflict-decision rules for Runebook.
//!
//! This crate provides:
//! - [`Row`] payloads and timestamp accessors
//! - [`PendingOp`] for queued local writes
//! - [`Conflict`] records and [`ConflictResolution`] tags
//! - [`requires_resolution`], the pure conflict-decision predicate
//!
//! This is a pure types crate with no I/O operations. The durable stores and
//! the push/pull engine live in `runebook_sync_engine`.
//!
//! ## Key Invariants
//!
//! - At most one pending op per entity; re-enqueueing overwrites, never
//!   appends
//! - At most one open conflict per entity; a fresh divergence reopens a
//!   previously resolved record
//! - Conflicts are detected, never silently resolved

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod pending;
mod row;

pub use conflict::{requires_resolution, Conflict, ConflictResolution};
pub use pending::{op_key, OpKind, PendingOp};
pub use row::{row_id, row_timestamp, Row, UPDATED_AT};
