use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use keel_common::{KeelError, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::{check_table_name, matches_all, project, Conditions, Record, Storage};

const DATABASE_FILE: &str = "keel.db";

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS keel_rows (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        tbl TEXT NOT NULL,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS keel_sequences (
        tbl TEXT PRIMARY KEY,
        next_id INTEGER NOT NULL
    )",
];

/// A SQLite database under a data directory, shared by every worker
/// process pointed at that directory.
///
/// Rows are stored as JSON documents and filtered on the host, so tables
/// stay schemaless. Every write runs in a `BEGIN IMMEDIATE` transaction,
/// which serializes writers across processes; readers see the last
/// committed state.
pub struct SqliteStorage {
    root: PathBuf,
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            KeelError::Storage(format!("Failed to create {}: {}", root.display(), e))
        })?;

        let options = SqliteConnectOptions::new()
            .filename(root.join(DATABASE_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_error)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_error)?;
        }

        tracing::debug!(path = %root.display(), "Opened storage");
        Ok(Self { root, pool })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `op` inside an immediate transaction, committing on success.
    ///
    /// The transaction runs on its own task so a caller that goes away
    /// mid-write cannot leave a pooled connection inside a transaction.
    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut conn = pool.acquire().await.map_err(db_error)?;
            sqlx::query("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await
                .map_err(db_error)?;
            let outcome = op(&mut *conn).await;
            let end = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
            sqlx::query(end).execute(&mut *conn).await.map_err(db_error)?;
            outcome
        })
        .await
        .map_err(|e| KeelError::Storage(format!("Storage task failed: {}", e)))?
    }
}

fn db_error(err: sqlx::Error) -> KeelError {
    KeelError::Storage(err.to_string())
}

fn decode(data: &str) -> Result<Record> {
    serde_json::from_str(data).map_err(|e| KeelError::Storage(format!("Corrupt row: {}", e)))
}

async fn rows(conn: &mut SqliteConnection, table: &str) -> Result<Vec<(i64, Record)>> {
    let raw: Vec<(i64, String)> =
        sqlx::query_as("SELECT seq, data FROM keel_rows WHERE tbl = ? ORDER BY seq")
            .bind(table)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error)?;
    raw.into_iter()
        .map(|(seq, data)| Ok((seq, decode(&data)?)))
        .collect()
}

async fn insert_row(conn: &mut SqliteConnection, table: String, mut record: Record) -> Result<Value> {
    let next_id: i64 = sqlx::query_scalar("SELECT next_id FROM keel_sequences WHERE tbl = ?")
        .bind(&table)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .unwrap_or(0);

    let id = match record.get("id").and_then(Value::as_i64) {
        Some(id) => id,
        None => {
            let id = next_id.max(1);
            record.insert("id".into(), Value::from(id));
            id
        }
    };

    sqlx::query(
        "INSERT INTO keel_sequences (tbl, next_id) VALUES (?, ?)
         ON CONFLICT(tbl) DO UPDATE SET next_id = excluded.next_id",
    )
    .bind(&table)
    .bind(next_id.max(id + 1))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    sqlx::query("INSERT INTO keel_rows (tbl, data) VALUES (?, ?)")
        .bind(&table)
        .bind(serde_json::to_string(&record)?)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    Ok(record.get("id").cloned().unwrap_or(Value::from(id)))
}

async fn update_rows(
    conn: &mut SqliteConnection,
    table: String,
    delta: Record,
    conditions: Conditions,
) -> Result<u64> {
    let mut changed = 0;
    for (seq, mut row) in rows(conn, &table).await? {
        if !matches_all(&row, &conditions) {
            continue;
        }
        for (key, value) in &delta {
            row.insert(key.clone(), value.clone());
        }
        sqlx::query("UPDATE keel_rows SET data = ? WHERE seq = ?")
            .bind(serde_json::to_string(&row)?)
            .bind(seq)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        changed += 1;
    }
    Ok(changed)
}

async fn delete_rows(conn: &mut SqliteConnection, table: String, conditions: Conditions) -> Result<u64> {
    let mut removed = 0;
    for (seq, row) in rows(conn, &table).await? {
        if !matches_all(&row, &conditions) {
            continue;
        }
        sqlx::query("DELETE FROM keel_rows WHERE seq = ?")
            .bind(seq)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        removed += 1;
    }
    Ok(removed)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert(&self, table: &str, record: Record) -> Result<Value> {
        check_table_name(table)?;
        let table = table.to_string();
        self.write(move |conn| Box::pin(insert_row(conn, table, record)))
            .await
    }

    async fn select(&self, table: &str, fields: &[&str], conditions: &Conditions) -> Result<Vec<Record>> {
        check_table_name(table)?;
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        Ok(rows(&mut *conn, table)
            .await?
            .into_iter()
            .filter(|(_, row)| matches_all(row, conditions))
            .map(|(_, row)| project(&row, fields))
            .collect())
    }

    async fn update(&self, table: &str, delta: Record, conditions: &Conditions) -> Result<u64> {
        check_table_name(table)?;
        let (table, conditions) = (table.to_string(), conditions.clone());
        self.write(move |conn| Box::pin(update_rows(conn, table, delta, conditions)))
            .await
    }

    async fn delete(&self, table: &str, conditions: &Conditions) -> Result<u64> {
        check_table_name(table)?;
        let (table, conditions) = (table.to_string(), conditions.clone());
        self.write(move |conn| Box::pin(delete_rows(conn, table, conditions)))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
