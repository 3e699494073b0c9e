//! Remote store abstraction.
//!
//! The actual transport (HTTP client, auth refresh, retries) lives in the
//! app; this trait is the narrow surface the engine needs. Implementations
//! map their own failures onto the [`SyncError`] taxonomy: unreachable or
//! unconfigured backends become [`SyncError::NotConfigured`], everything
//! else a remote rejects becomes [`SyncError::Remote`] with the message
//! passed through verbatim.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runebook_sync_protocol::{row_timestamp, Row, UPDATED_AT};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// An authenticated remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Remote user id owning this tenant's rows.
    pub user_id: String,
}

/// Sign-in credentials, forwarded to the remote auth endpoint.
#[derive(Clone)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A remote multi-tenant store.
pub trait RemoteClient: Send + Sync {
    /// Returns the active session, or `None` when signed out.
    fn session(&self) -> SyncResult<Option<Session>>;

    /// Signs in, establishing a session.
    fn sign_in(&self, credentials: &Credentials) -> SyncResult<Session>;

    /// Signs out, dropping the session.
    fn sign_out(&self) -> SyncResult<()>;

    /// Idempotently inserts or updates one row, keyed on `conflict_key`.
    fn upsert(&self, table: &str, row: &Row, conflict_key: &str) -> SyncResult<()>;

    /// Fetches rows of `table` whose `updated_at` is strictly greater than
    /// `since`, ascending by `updated_at`, at most `limit` rows, projected
    /// to `columns`.
    fn changed_since(
        &self,
        table: &str,
        columns: &[String],
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> SyncResult<Vec<Row>>;
}

struct UpsertFailure {
    /// Upserts still allowed to succeed before the failure triggers.
    after: u32,
    message: String,
}

/// A scripted remote store for tests.
#[derive(Default)]
pub struct MockRemote {
    reachable: AtomicBool,
    session: Mutex<Option<Session>>,
    rows: Mutex<HashMap<String, Vec<Row>>>,
    upserts: Mutex<Vec<(String, Row)>>,
    upsert_failure: Mutex<Option<UpsertFailure>>,
}

impl MockRemote {
    /// Creates a reachable, signed-out mock.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            session: Mutex::new(None),
            rows: Mutex::new(HashMap::new()),
            upserts: Mutex::new(Vec::new()),
            upsert_failure: Mutex::new(None),
        }
    }

    /// Creates a reachable mock with an active session.
    pub fn signed_in(user_id: &str) -> Self {
        let mock = Self::new();
        *mock.session.lock() = Some(Session {
            user_id: user_id.to_string(),
        });
        mock
    }

    /// Toggles reachability; unreachable mocks fail every call.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Replaces the scripted rows for `table`.
    pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
        self.rows.lock().insert(table.to_string(), rows);
    }

    /// Makes every subsequent upsert fail with `message` until cleared.
    pub fn set_upsert_error(&self, message: &str) {
        self.set_upsert_error_after(0, message);
    }

    /// Lets `after` more upserts succeed, then fails the rest with
    /// `message` until cleared.
    pub fn set_upsert_error_after(&self, after: u32, message: &str) {
        *self.upsert_failure.lock() = Some(UpsertFailure {
            after,
            message: message.to_string(),
        });
    }

    /// Clears an injected upsert failure.
    pub fn clear_upsert_error(&self) {
        *self.upsert_failure.lock() = None;
    }

    /// Returns every upsert received, in arrival order.
    pub fn upserts(&self) -> Vec<(String, Row)> {
        self.upserts.lock().clone()
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotConfigured("remote unreachable".into()))
        }
    }
}

impl RemoteClient for MockRemote {
    fn session(&self) -> SyncResult<Option<Session>> {
        self.check_reachable()?;
        Ok(self.session.lock().clone())
    }

    fn sign_in(&self, credentials: &Credentials) -> SyncResult<Session> {
        self.check_reachable()?;
        let session = Session {
            user_id: credentials.email.clone(),
        };
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    fn sign_out(&self) -> SyncResult<()> {
        *self.session.lock() = None;
        Ok(())
    }

    fn upsert(&self, table: &str, row: &Row, _conflict_key: &str) -> SyncResult<()> {
        self.check_reachable()?;
        if let Some(failure) = self.upsert_failure.lock().as_mut() {
            if failure.after == 0 {
                return Err(SyncError::Remote(failure.message.clone()));
            }
            failure.after -= 1;
        }
        self.upserts.lock().push((table.to_string(), row.clone()));
        Ok(())
    }

    fn changed_since(
        &self,
        table: &str,
        columns: &[String],
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> SyncResult<Vec<Row>> {
        self.check_reachable()?;
        let rows = self.rows.lock();
        let mut matched: Vec<Row> = rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| match (since, row_timestamp(row, UPDATED_AT)) {
                        (Some(watermark), Some(updated)) => updated > watermark,
                        (Some(_), None) => false,
                        (None, _) => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by_key(|row| row_timestamp(row, UPDATED_AT));
        matched.truncate(limit as usize);
        for row in &mut matched {
            row.retain(|column, _| columns.iter().any(|c| c == column));
        }
        Ok(matched)
    }
}
