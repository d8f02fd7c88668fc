//! Database schema management for `thermoguard`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::SqlitePool;

// ---

/// Create the database schema (idempotent).
///
/// Creates the `temperature_records` table for accepted readings and the
/// `error_logs` table for client-reported errors. Safe to call on every
/// startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Accepted readings, appended by the ingestion pipeline
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS temperature_records (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp  TEXT    NOT NULL,
            avg_temp1  REAL    NOT NULL,
            avg_temp2  REAL    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS error_logs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp  TEXT    NOT NULL,
            message    TEXT    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Both tables are only ever queried by time window
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_temperature_records_timestamp
            ON temperature_records (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_error_logs_timestamp
            ON error_logs (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
