//! # State Record Repository
//!
//! Key/value storage for versioned JSON records.
//!
//! ```text
//! key                          schema_version  payload
//! ───────────────────────────  ──────────────  ─────────────────────────────
//! session_tokens.<link>        1               {"device_id":..,"token":..}
//! snapshot_cache.<link>        1               {"frame_status":{..},..}
//! ```
//!
//! The repository does not interpret payloads. Version checks happen in the
//! caller, which knows the current schema of each record type.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StateRecord {
    pub key: String,
    pub schema_version: i64,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

/// Repository for `state_records`.
#[derive(Debug, Clone)]
pub struct StateRecordRepository {
    pool: SqlitePool,
}

impl StateRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        StateRecordRepository { pool }
    }

    /// Fetch one record; `None` when absent.
    pub async fn get(&self, key: &str) -> DbResult<Option<StateRecord>> {
        let record = sqlx::query_as::<_, StateRecord>(
            r#"
            SELECT key, schema_version, payload, updated_at
            FROM state_records
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Insert or replace a record.
    pub async fn upsert(&self, key: &str, schema_version: u32, payload: &str) -> DbResult<()> {
        let now = Utc::now();

        debug!(key = %key, schema_version, bytes = payload.len(), "Saving state record");

        sqlx::query(
            r#"
            INSERT INTO state_records (key, schema_version, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                schema_version = excluded.schema_version,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(i64::from(schema_version))
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a record. Returns whether a row existed.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM state_records WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
