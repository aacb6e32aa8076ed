//! # State Store
//!
//! Durable storage seam for the two per-link records.
//!
//! ```text
//!   SessionManager ──► session_tokens.<link_id>  ─┐
//!                                                 ├──► StateStore ──► SQLite
//!   SyncAgent      ──► snapshot_cache.<link_id>  ─┘                 └► memory
//! ```
//!
//! Each record carries its schema version. A record written by a newer
//! build, or one that no longer decodes, is treated as absent: the caller
//! cold-starts instead of failing.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use inkposter_db::Database;

use crate::error::{SyncError, SyncResult};

/// Key of the token record for one link.
pub fn session_key(link_id: &str) -> String {
    format!("session_tokens.{}", link_id)
}

/// Key of the cached snapshot for one link.
pub fn snapshot_key(link_id: &str) -> String {
    format!("snapshot_cache.{}", link_id)
}

/// A versioned JSON record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub version: u32,
    pub payload: Value,
}

/// Persistence seam. Absence is a normal cold-start condition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_record(&self, key: &str) -> SyncResult<Option<StoredRecord>>;

    async fn save_record(&self, key: &str, record: StoredRecord) -> SyncResult<()>;

    async fn delete_record(&self, key: &str) -> SyncResult<()>;
}

// =============================================================================
// Typed Helpers
// =============================================================================

/// Loads and decodes a record, treating newer or corrupt records as absent.
pub async fn load_versioned<T>(
    store: &dyn StateStore,
    key: &str,
    current_version: u32,
) -> SyncResult<Option<T>>
where
    T: DeserializeOwned,
{
    let Some(record) = store.load_record(key).await? else {
        debug!(key = %key, "No persisted record");
        return Ok(None);
    };

    if record.version > current_version {
        warn!(
            key = %key,
            found = record.version,
            supported = current_version,
            "Persisted record has a newer schema, ignoring"
        );
        return Ok(None);
    }

    match serde_json::from_value::<T>(record.payload) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key = %key, error = %e, "Persisted record does not decode, ignoring");
            Ok(None)
        }
    }
}

/// Encodes and saves a record at the given schema version.
pub async fn save_versioned<T>(
    store: &dyn StateStore,
    key: &str,
    version: u32,
    value: &T,
) -> SyncResult<()>
where
    T: Serialize,
{
    let payload = serde_json::to_value(value)?;
    store
        .save_record(key, StoredRecord { version, payload })
        .await
}

// =============================================================================
// Implementations
// =============================================================================

/// In-process store for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_record(&self, key: &str) -> SyncResult<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save_record(&self, key: &str, record: StoredRecord) -> SyncResult<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> SyncResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load_record(&self, key: &str) -> SyncResult<Option<StoredRecord>> {
        let Some(row) = self.records().get(key).await? else {
            return Ok(None);
        };

        let version = u32::try_from(row.schema_version).map_err(|_| {
            SyncError::Store(format!(
                "record {} has invalid schema version {}",
                key, row.schema_version
            ))
        })?;

        match serde_json::from_str(&row.payload) {
            Ok(payload) => Ok(Some(StoredRecord { version, payload })),
            Err(e) => {
                warn!(key = %key, error = %e, "Stored payload is not JSON, ignoring");
                Ok(None)
            }
        }
    }

    async fn save_record(&self, key: &str, record: StoredRecord) -> SyncResult<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.records().upsert(key, record.version, &payload).await?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> SyncResult<()> {
        self.records().delete(key).await?;
        Ok(())
    }
}
