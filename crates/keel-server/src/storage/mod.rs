//! Storage capability
//!
//! Methods and the session manager persist through the [`Storage`] trait.
//! Two implementations ship with the server:
//!
//! - [`MemoryStorage`] keeps tables in process memory
//! - [`SqliteStorage`] keeps every table in one SQLite database under a
//!   data directory, which lets several worker processes share sessions

mod conditions;
mod memory;
mod sqlite;

use async_trait::async_trait;
use keel_common::{KeelError, Result};
use serde_json::{Map, Value};

pub use conditions::{glob_match, matches_all, Condition, Conditions, Operator};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

pub type Record = Map<String, Value>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts `record` and returns its `id`. An `id` is assigned when absent.
    async fn insert(&self, table: &str, record: Record) -> Result<Value>;

    /// Returns the matching rows projected onto `fields`. An empty field
    /// list or `"*"` selects every field.
    async fn select(&self, table: &str, fields: &[&str], conditions: &Conditions) -> Result<Vec<Record>>;

    /// Merges `delta` into matching rows and returns how many changed.
    async fn update(&self, table: &str, delta: Record, conditions: &Conditions) -> Result<u64>;

    /// Deletes matching rows and returns how many were removed.
    async fn delete(&self, table: &str, conditions: &Conditions) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// Rows of one table plus its id sequence.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    next_id: i64,
    rows: Vec<Record>,
}

impl Table {
    pub(crate) fn insert(&mut self, mut record: Record) -> Value {
        let id = match record.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                let id = self.next_id.max(1);
                record.insert("id".into(), Value::from(id));
                id
            }
        };
        self.next_id = self.next_id.max(id + 1);
        let assigned = record.get("id").cloned().unwrap_or(Value::from(id));
        self.rows.push(record);
        assigned
    }

    pub(crate) fn select(&self, fields: &[&str], conditions: &Conditions) -> Vec<Record> {
        self.rows
            .iter()
            .filter(|row| matches_all(row, conditions))
            .map(|row| project(row, fields))
            .collect()
    }

    pub(crate) fn update(&mut self, delta: &Record, conditions: &Conditions) -> u64 {
        let mut changed = 0;
        for row in self.rows.iter_mut().filter(|row| matches_all(row, conditions)) {
            for (key, value) in delta {
                row.insert(key.clone(), value.clone());
            }
            changed += 1;
        }
        changed
    }

    pub(crate) fn delete(&mut self, conditions: &Conditions) -> u64 {
        let before = self.rows.len();
        self.rows.retain(|row| !matches_all(row, conditions));
        (before - self.rows.len()) as u64
    }
}

/// Copies `fields` out of `row`. An empty list or `"*"` keeps every field.
pub(crate) fn project(row: &Record, fields: &[&str]) -> Record {
    if fields.is_empty() || fields.contains(&"*") {
        return row.clone();
    }
    fields
        .iter()
        .filter_map(|field| row.get(*field).map(|v| (field.to_string(), v.clone())))
        .collect()
}

/// Table names are restricted to `[A-Za-z0-9_]`.
pub(crate) fn check_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeelError::Storage(format!("invalid table name: {:?}", table)))
    }
}

/// Builds a [`Conditions`] map from `(field, value)` pairs.
pub fn conditions<I, K>(pairs: I) -> Conditions
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
