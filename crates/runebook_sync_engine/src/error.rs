//! Error types for the sync engine.

use crate::store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// The first two variants classify as *offline* rather than *error*: the
/// remote store being unset/unreachable or the session being absent is an
/// expected steady state for an offline-first app, and callers treat it as
/// "can't reach" instead of "misbehaving".
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote backend is unset or unreachable.
    #[error("remote backend unavailable: {0}")]
    NotConfigured(String),

    /// No active session; the caller must sign in first.
    #[error("no active session")]
    NotSignedIn,

    /// The remote store rejected a request. The message is passed through
    /// verbatim from the remote.
    #[error("remote error: {0}")]
    Remote(String),

    /// Local storage error; aborts the current call.
    #[error("local storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SyncError {
    /// Returns true if this error means "offline" rather than "failed".
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::NotConfigured(_) | SyncError::NotSignedIn)
    }

    /// Returns the verbatim remote message, if this is a remote failure.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            SyncError::Remote(message) => Some(message),
            _ => None,
        }
    }
}
