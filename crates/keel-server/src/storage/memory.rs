use std::collections::HashMap;

use async_trait::async_trait;
use keel_common::Result;
use parking_lot::Mutex;
use serde_json::Value;

use super::{check_table_name, Conditions, Record, Storage, Table};

/// Process-local storage. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert(&self, table: &str, record: Record) -> Result<Value> {
        check_table_name(table)?;
        Ok(self.tables.lock().entry(table.to_string()).or_default().insert(record))
    }

    async fn select(&self, table: &str, fields: &[&str], conditions: &Conditions) -> Result<Vec<Record>> {
        check_table_name(table)?;
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.select(fields, conditions))
            .unwrap_or_default())
    }

    async fn update(&self, table: &str, delta: Record, conditions: &Conditions) -> Result<u64> {
        check_table_name(table)?;
        Ok(self
            .tables
            .lock()
            .get_mut(table)
            .map(|t| t.update(&delta, conditions))
            .unwrap_or(0))
    }

    async fn delete(&self, table: &str, conditions: &Conditions) -> Result<u64> {
        check_table_name(table)?;
        Ok(self
            .tables
            .lock()
            .get_mut(table)
            .map(|t| t.delete(conditions))
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
