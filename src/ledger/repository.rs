use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

use super::models::*;
use crate::error::{AppError, AppResult};

/// Durable key/value bookkeeping
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> AppResult<()>;

    async fn get(&self, key: &str) -> AppResult<Option<Value>>;

    async fn get_or_default(&self, key: &str, default: Value) -> AppResult<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}

/// Postgres-backed store, one row per key
pub struct PgKvStore {
    pub pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn put(&self, key: &str, value: Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT value
            FROM kv_entries
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }
}

/// In-process store
pub struct MemoryKvStore {
    entries: tokio::sync::RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Value) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }
}

/// Typed view of the store used by the watcher
///
/// Layout: `current -> slot`, `slot_<n> -> ProcessingRecord`,
/// `tx_<signature> -> ProcessingRecord`, `error -> [slot]`.
pub struct ProcessingJournal {
    store: Arc<dyn KvStore>,
}

impl ProcessingJournal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn put_as<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        self.store.put(key, serde_json::to_value(value)?).await
    }

    // ========== SLOT POINTER ==========

    pub async fn last_seen(&self) -> AppResult<u64> {
        let value = self.store.get_or_default(CURRENT_KEY, Value::from(0u64)).await?;
        serde_json::from_value(value).map_err(AppError::from)
    }

    pub async fn set_last_seen(&self, slot: u64) -> AppResult<()> {
        self.put_as(CURRENT_KEY, &slot).await
    }

    // ========== PROCESSING RECORDS ==========

    pub async fn record(&self, key: &RecordKey) -> AppResult<Option<ProcessingRecord>> {
        self.get_as(&key.to_string()).await
    }

    /// Write a record unless a settled one already exists under its key
    pub async fn write_record(&self, record: &ProcessingRecord) -> AppResult<()> {
        if let Some(existing) = self.get_as::<ProcessingRecord>(&record.key).await? {
            if existing.is_settled() {
                warn!("Refusing to overwrite settled record {}", record.key);
                return Err(AppError::AlreadySettled {
                    key: record.key.clone(),
                });
            }
        }

        self.put_as(&record.key, record).await
    }

    // ========== FAILED SLOTS ==========

    pub async fn failed_slots(&self) -> AppResult<Vec<u64>> {
        Ok(self.get_as(ERROR_KEY).await?.unwrap_or_default())
    }

    pub async fn push_failed_slot(&self, slot: u64) -> AppResult<()> {
        let mut slots = self.failed_slots().await?;
        if slots.contains(&slot) {
            return Ok(());
        }

        slots.push(slot);
        slots.sort_unstable();
        self.put_as(ERROR_KEY, &slots).await
    }

    pub async fn remove_failed_slot(&self, slot: u64) -> AppResult<()> {
        let mut slots = self.failed_slots().await?;
        let before = slots.len();
        slots.retain(|s| *s != slot);

        if slots.len() != before {
            info!("Slot {} removed from the failure list", slot);
            self.put_as(ERROR_KEY, &slots).await?;
        }

        Ok(())
    }
}
