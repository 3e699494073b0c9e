//! Per-entity schema registry and statement generation.
//!
//! The registry is the engine's only contract with the storage schema: each
//! [`EntitySpec`] names the table, its primary key, and one ordered column
//! list, and that single list drives both the remote delta query and the
//! local upsert statement so the two can never drift apart. Table creation
//! and migration belong to the app's migration system, not to this crate.

use runebook_sync_protocol::Row;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Predicate partitioning a physical table into its synced subset.
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Immutable schema description of one synced entity type.
#[derive(Clone)]
pub struct EntitySpec {
    table: String,
    primary_key: String,
    created_column: String,
    columns: Vec<String>,
    include: Option<RowPredicate>,
}

impl EntitySpec {
    /// Creates a spec for `table` keyed by `primary_key` with the given
    /// ordered column list. The creation-time column defaults to
    /// `created_at`.
    ///
    /// # Panics
    ///
    /// Panics if `primary_key` is not in `columns` — a spec that cannot
    /// address its own rows is a programmer error.
    pub fn new<S: Into<String>>(table: S, primary_key: S, columns: &[&str]) -> Self {
        let table = table.into();
        let primary_key = primary_key.into();
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        assert!(
            columns.iter().any(|c| *c == primary_key),
            "entity spec for `{table}` does not list its primary key `{primary_key}`"
        );
        Self {
            table,
            primary_key,
            created_column: "created_at".to_string(),
            columns,
            include: None,
        }
    }

    /// Overrides the creation-time column name.
    pub fn with_created_column(mut self, column: impl Into<String>) -> Self {
        self.created_column = column.into();
        self
    }

    /// Restricts sync to rows matching `predicate`.
    ///
    /// Lets one physical table expose only a subset of its rows to sync,
    /// e.g. a single reserved key of a generic key/value table while other
    /// keys stay local-only.
    pub fn with_include<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.include = Some(Arc::new(predicate));
        self
    }

    /// Returns the table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the primary-key column name.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Returns the creation-time column name.
    pub fn created_column(&self) -> &str {
        &self.created_column
    }

    /// Returns the ordered column list.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns true if `row` belongs to the synced subset of this table.
    pub fn includes(&self, row: &Row) -> bool {
        match &self.include {
            Some(predicate) => predicate(row),
            None => true,
        }
    }

    /// Builds the idempotent insert-or-update statement for this table.
    ///
    /// The update clause excludes the primary key and the creation-time
    /// column: identity and original creation time are immutable once set.
    pub fn upsert_statement(&self) -> String {
        let column_list = self.columns.join(", ");
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = self
            .columns
            .iter()
            .filter(|c| **c != self.primary_key && **c != self.created_column)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        if updates.is_empty() {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
                self.table,
                column_list,
                placeholders.join(", "),
                self.primary_key
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
                self.table,
                column_list,
                placeholders.join(", "),
                self.primary_key,
                updates.join(", ")
            )
        }
    }

    /// Returns `row` reshaped to exactly this spec's columns.
    ///
    /// Absent fields become JSON null and fields outside the column list are
    /// dropped, so the remote store always receives the same shape the local
    /// upsert binds.
    pub fn normalized_payload(&self, row: &Row) -> Row {
        let mut normalized = Row::new();
        for column in &self.columns {
            let value = row.get(column).cloned().unwrap_or(Value::Null);
            normalized.insert(column.clone(), value);
        }
        normalized
    }

    /// Returns `row`'s values in column order, for binding against
    /// [`upsert_statement`](Self::upsert_statement).
    pub fn bind_values(&self, row: &Row) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl fmt::Debug for EntitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySpec")
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("created_column", &self.created_column)
            .field("columns", &self.columns)
            .field("include", &self.include.is_some())
            .finish()
    }
}

/// Static registry of every synced entity type.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    specs: Vec<EntitySpec>,
    by_table: HashMap<String, usize>,
}

impl TableRegistry {
    /// Creates a registry from the given specs, preserving order.
    ///
    /// # Panics
    ///
    /// Panics if two specs name the same table.
    pub fn new(specs: Vec<EntitySpec>) -> Self {
        let mut by_table = HashMap::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let previous = by_table.insert(spec.table.clone(), index);
            assert!(
                previous.is_none(),
                "duplicate entity spec for table `{}`",
                spec.table
            );
        }
        Self { specs, by_table }
    }

    /// Returns the spec for `table`.
    ///
    /// # Panics
    ///
    /// Panics for unknown tables. Asking for an unregistered table is a
    /// programmer error, not a runtime condition to recover from.
    pub fn spec(&self, table: &str) -> &EntitySpec {
        match self.by_table.get(table) {
            Some(index) => &self.specs[*index],
            None => panic!("no entity spec registered for table `{table}`"),
        }
    }

    /// Iterates the specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &EntitySpec> {
        self.specs.iter()
    }

    /// Returns the number of registered tables.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true if no tables are registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
