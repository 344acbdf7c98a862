//! SQLite-backed record store.
//!
//! One table, upsert semantics, raw JSON text keyed by unit id. The schema
//! is deliberately minimal so upstream payload changes never require a
//! migration; downstream analytics work against the JSON column directly.
//!
//! The pool holds a single connection, so concurrent workers serialize
//! behind it. The write path is one short INSERT per record and never the
//! bottleneck against a rate-limited origin.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use harvest_core::error::HarvestError;
use harvest_core::sink::RecordStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id   TEXT PRIMARY KEY,
        json TEXT NOT NULL
    )
";

const UPSERT: &str = "
    INSERT INTO records (id, json) VALUES (?, ?)
    ON CONFLICT(id) DO UPDATE SET json = excluded.json
";

#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: Pool<Sqlite>,
}

impl SqliteRecordStore {
    /// Open (creating if missing) the database file and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self, HarvestError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(options).await
    }

    /// In-memory database, primarily for tests.
    pub async fn open_in_memory() -> Result<Self, HarvestError> {
        Self::connect(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, HarvestError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| HarvestError::Store(format!("failed to open database: {e}")))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| HarvestError::Store(format!("failed to create schema: {e}")))?;

        Ok(Self { pool })
    }
}

impl RecordStore for SqliteRecordStore {
    async fn put(&self, id: &str, json: &str) -> Result<(), HarvestError> {
        sqlx::query(UPSERT)
            .bind(id)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(|e| HarvestError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, HarvestError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT json FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HarvestError::Store(e.to_string()))?;
        Ok(row.map(|(json,)| json))
    }

    async fn count(&self) -> Result<u64, HarvestError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| HarvestError::Store(e.to_string()))?;
        Ok(row.0 as u64)
    }
}
