//! Durable tier: typed payloads over a [`CacheStore`].
//!
//! Reads are forgiving. An expired row is deleted and reported as a miss, a
//! row whose payload no longer decodes is deleted and reported as a miss,
//! and any store failure is logged and reported as a miss. Writes and bulk
//! operations propagate errors to the caller.
//!
//! The read-side deletes are conditional: a row is only removed while it is
//! still the write that was read, so a concurrent `set` is never lost.

use std::sync::Arc;
use std::time::Duration;

use canopy_core::{
    duration_to_ms, owner_prefix, CacheError, CachePayload, CacheResult, CacheRow, Clock,
    EpochMillis, StorageError,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::store::CacheStore;

/// A successful durable read.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableHit<T> {
    pub value: T,
    /// Absolute expiry of the row the value came from.
    pub expires_at: EpochMillis,
}

/// Disk-backed cache layer.
pub struct DurableTier<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: CacheStore> DurableTier<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn initialize(&self) -> CacheResult<()> {
        self.store.initialize().await
    }

    /// Serialize and persist `payload` with a fresh expiry.
    pub async fn set<T: CachePayload>(&self, key: &str, payload: &T, ttl: Duration) -> CacheResult<()> {
        let value = serde_json::to_value(payload).map_err(|e| CacheError::serialization(key, e))?;
        self.set_value(key, &value, ttl).await
    }

    /// Persist an already-converted payload.
    pub async fn set_value(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        if value.is_null() {
            return Err(CacheError::invalid_argument(
                "payload",
                "null payloads cannot be cached",
            ));
        }
        let data = serde_json::to_string(value).map_err(|e| CacheError::serialization(key, e))?;
        let row = CacheRow::new(key, data, self.clock.now_ms(), duration_to_ms(ttl));
        debug!(key = %key, expires_at = row.expires_at, "Durable tier set");
        self.store.upsert(row).await
    }

    /// Read and decode a payload. Never fails; see the module docs.
    pub async fn get<T: CachePayload>(&self, key: &str) -> Option<DurableHit<T>> {
        let now = self.clock.now_ms();

        let row = match self.store.fetch(key).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(key = %key, "Durable tier miss");
                return None;
            }
            Err(CacheError::Storage(StorageError::CorruptRecord { reason, .. })) => {
                warn!(key = %key, reason = %reason, "Corrupt durable row, removing");
                self.discard(key, None).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Durable tier read failed, treating as miss");
                return None;
            }
        };

        if row.is_expired(now) {
            debug!(key = %key, expires_at = row.expires_at, "Durable entry expired");
            self.discard(key, Some(&row)).await;
            return None;
        }

        let value: T = match serde_json::from_str(&row.data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable durable payload, removing");
                self.discard(key, Some(&row)).await;
                return None;
            }
        };

        if let Err(e) = self.store.record_hit(key, now).await {
            warn!(key = %key, error = %e, "Failed to record durable hit");
        }

        debug!(key = %key, "Durable tier hit");
        Some(DurableHit {
            value,
            expires_at: row.expires_at,
        })
    }

    async fn discard(&self, key: &str, seen: Option<&CacheRow>) {
        match self.store.delete_if_unchanged(key, seen).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "Durable row rewritten since read, kept"),
            Err(e) => warn!(key = %key, error = %e, "Failed to remove durable row"),
        }
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(key).await
    }

    /// Delete every row whose key contains `pattern`.
    pub async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        self.store.delete_matching(pattern).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        self.store.clear().await
    }

    pub async fn delete_expired(&self) -> CacheResult<u64> {
        self.store.delete_expired(self.clock.now_ms()).await
    }

    pub async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>> {
        self.store.most_frequently_used(limit).await
    }

    pub async fn keys_for_owner(&self, owner_id: &str) -> CacheResult<Vec<String>> {
        self.store.keys_matching(&owner_prefix(owner_id)?).await
    }

    pub async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>> {
        self.store.least_recently_used(limit).await
    }

    pub async fn count(&self) -> CacheResult<u64> {
        self.store.count().await
    }

    pub async fn flush(&self) -> CacheResult<()> {
        self.store.flush().await
    }
}
