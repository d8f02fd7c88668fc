//! Persistence for accepted readings and the error log.
//!
//! Both stores are thin wrappers over a shared [`SqlitePool`]; they are cheap
//! to clone and safe to use concurrently from the ingestion worker and the
//! HTTP handlers. Timestamps are assigned here, at append time, so insertion
//! order and timestamp order agree.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{ErrorLogEntry, Reading};

// ---

/// Open (creating if needed) the SQLite database file at `path`.
pub async fn open_pool(path: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    // ---
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Open a private in-memory database.
///
/// Every SQLite connection to `:memory:` gets its own database, so the pool
/// is pinned to a single connection that is never recycled.
pub async fn open_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    // ---
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Append-only history of accepted readings.
#[derive(Debug, Clone)]
pub struct ReadingHistory {
    pool: SqlitePool,
}

impl ReadingHistory {
    // ---
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store one reading, stamped with the current time.
    pub async fn append(&self, avg_temp1: f64, avg_temp2: f64) -> Result<Reading, sqlx::Error> {
        // ---
        sqlx::query_as::<_, Reading>(
            r#"
            INSERT INTO temperature_records (timestamp, avg_temp1, avg_temp2)
            VALUES (?, ?, ?)
            RETURNING id, timestamp, avg_temp1, avg_temp2
            "#,
        )
        .bind(Utc::now())
        .bind(avg_temp1)
        .bind(avg_temp2)
        .fetch_one(&self.pool)
        .await
    }

    /// The `n` most recent readings, newest first.
    pub async fn latest(&self, n: u32) -> Result<Vec<Reading>, sqlx::Error> {
        // ---
        sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, timestamp, avg_temp1, avg_temp2
            FROM temperature_records
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(n))
        .fetch_all(&self.pool)
        .await
    }

    /// The most recent reading, if any.
    pub async fn current(&self) -> Result<Option<Reading>, sqlx::Error> {
        Ok(self.latest(1).await?.into_iter().next())
    }

    /// All readings at or after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<Reading>, sqlx::Error> {
        // ---
        sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, timestamp, avg_temp1, avg_temp2
            FROM temperature_records
            WHERE timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    /// Delete every reading, returning how many were removed.
    pub async fn clear(&self) -> Result<u64, sqlx::Error> {
        // ---
        let result = sqlx::query("DELETE FROM temperature_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Independent log of client-reported operational errors.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    pool: SqlitePool,
}

impl ErrorLog {
    // ---
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, message: &str) -> Result<ErrorLogEntry, sqlx::Error> {
        // ---
        sqlx::query_as::<_, ErrorLogEntry>(
            r#"
            INSERT INTO error_logs (timestamp, message)
            VALUES (?, ?)
            RETURNING id, timestamp, message
            "#,
        )
        .bind(Utc::now())
        .bind(message)
        .fetch_one(&self.pool)
        .await
    }

    /// Entries at or after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<ErrorLogEntry>, sqlx::Error> {
        // ---
        sqlx::query_as::<_, ErrorLogEntry>(
            r#"
            SELECT id, timestamp, message
            FROM error_logs
            WHERE timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn clear(&self) -> Result<u64, sqlx::Error> {
        // ---
        let result = sqlx::query("DELETE FROM error_logs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
