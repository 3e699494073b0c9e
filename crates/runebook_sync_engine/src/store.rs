//! Local storage abstraction and the SQLite implementation.
//!
//! The engine only ever issues DML: the domain tables it syncs are created
//! and migrated by the app, while the engine's own bookkeeping tables
//! (pending ops, conflicts, sync state) are ensured here at startup.

use parking_lot::Mutex;
use runebook_sync_protocol::Row;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Result type for local storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the local datastore.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted sync record could not be decoded.
    #[error("corrupt sync record: {0}")]
    Corrupt(String),
}

/// The embedded local datastore, as the engine sees it.
///
/// Cells and parameters are JSON values; nested values are stored as JSON
/// text. Implementations must support idempotent insert-or-update statements
/// keyed by a declared primary key (`ON CONFLICT ... DO UPDATE`).
pub trait LocalStore: Send + Sync {
    /// Executes a statement, returning the number of affected rows.
    fn execute(&self, statement: &str, params: &[Value]) -> StoreResult<usize>;

    /// Runs a query, returning all rows keyed by column name.
    fn select(&self, query: &str, params: &[Value]) -> StoreResult<Vec<Row>>;
}

/// [`LocalStore`] over a single rusqlite connection.
///
/// The connection is mutex-guarded: the local store is single-writer per
/// process and individual statements serialize through the lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }
}

impl LocalStore for SqliteStore {
    fn execute(&self, statement: &str, params: &[Value]) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(statement)?;
        let affected = stmt.execute(rusqlite::params_from_iter(params.iter().map(bind_value)))?;
        Ok(affected)
    }

    fn select(&self, query: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(bind_value)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (index, column) in columns.iter().enumerate() {
                record.insert(column.clone(), cell_value(row.get_ref(index)?));
            }
            out.push(record);
        }
        Ok(out)
    }
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Nested values are stored as JSON text.
        other => Sql::Text(other.to_string()),
    }
}

fn cell_value(cell: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Reads the `n` column of a `SELECT COUNT(*) AS n` result.
pub(crate) fn count_from(rows: &[Row]) -> StoreResult<u64> {
    rows.first()
        .and_then(|row| row.get("n"))
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Corrupt("count query returned no row".into()))
}

/// Creates the engine-owned bookkeeping tables if they do not exist.
///
/// Domain tables stay owned by the app's migration system; only
/// `sync_pending_ops`, `sync_conflicts`, and the `sync_state` singleton are
/// managed here.
pub fn ensure_sync_tables<S: LocalStore>(store: &S) -> StoreResult<()> {
    store.execute(
        "CREATE TABLE IF NOT EXISTS sync_pending_ops (
           op_id TEXT PRIMARY KEY,
           table_name TEXT NOT NULL,
           entity_id TEXT NOT NULL,
           op_kind TEXT NOT NULL,
           payload TEXT NOT NULL,
           created_at TEXT NOT NULL,
           updated_at TEXT NOT NULL
         )",
        &[],
    )?;
    store.execute(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
           conflict_id TEXT PRIMARY KEY,
           table_name TEXT NOT NULL,
           entity_id TEXT NOT NULL,
           local_payload TEXT NOT NULL,
           remote_payload TEXT NOT NULL,
           local_updated_at TEXT,
           remote_updated_at TEXT,
           detected_at TEXT NOT NULL,
           resolved_at TEXT,
           resolution TEXT
         )",
        &[],
    )?;
    store.execute(
        "CREATE TABLE IF NOT EXISTS sync_state (
           id INTEGER PRIMARY KEY CHECK (id = 1),
           last_pulled_at TEXT,
           last_pushed_at TEXT,
           open_conflict_count INTEGER NOT NULL DEFAULT 0
         )",
        &[],
    )?;
    store.execute("INSERT OR IGNORE INTO sync_state (id) VALUES (1)", &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE scratch (id TEXT PRIMARY KEY, n INTEGER, f REAL, s TEXT)",
                &[],
            )
            .unwrap();
        store
    }

    #[test]
    fn execute_reports_affected_rows() {
        let store = scratch_store();
        let affected = store
            .execute(
                "INSERT INTO scratch (id, n) VALUES (?1, ?2)",
                &[json!("a"), json!(1)],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let affected = store
            .execute("UPDATE scratch SET n = 2 WHERE id = ?1", &[json!("missing")])
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn select_maps_cell_types() {
        let store = scratch_store();
        store
            .execute(
                "INSERT INTO scratch (id, n, f, s) VALUES (?1, ?2, ?3, ?4)",
                &[json!("a"), json!(42), json!(1.5), json!("hello")],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO scratch (id, n, f, s) VALUES (?1, ?2, ?3, ?4)",
                &[json!("b"), Value::Null, Value::Null, Value::Null],
            )
            .unwrap();

        let rows = store
            .select("SELECT * FROM scratch ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["n"], json!(42));
        assert_eq!(rows[0]["f"], json!(1.5));
        assert_eq!(rows[0]["s"], json!("hello"));
        assert_eq!(rows[1]["n"], Value::Null);
    }

    #[test]
    fn nested_values_round_trip_as_json_text() {
        let store = scratch_store();
        store
            .execute(
                "INSERT INTO scratch (id, s) VALUES (?1, ?2)",
                &[json!("a"), json!({"hp": 12, "items": ["rope"]})],
            )
            .unwrap();

        let rows = store
            .select("SELECT s FROM scratch WHERE id = ?1", &[json!("a")])
            .unwrap();
        let text = rows[0]["s"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed, json!({"hp": 12, "items": ["rope"]}));
    }

    #[test]
    fn booleans_bind_as_integers() {
        let store = scratch_store();
        store
            .execute(
                "INSERT INTO scratch (id, n) VALUES (?1, ?2)",
                &[json!("a"), json!(true)],
            )
            .unwrap();
        let rows = store
            .select("SELECT n FROM scratch WHERE id = ?1", &[json!("a")])
            .unwrap();
        assert_eq!(rows[0]["n"], json!(1));
    }

    #[test]
    fn ensure_sync_tables_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        ensure_sync_tables(&store).unwrap();
        ensure_sync_tables(&store).unwrap();

        let rows = store.select("SELECT id FROM sync_state", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }
}
