//! In-memory `CacheStore`.
//!
//! Rows live in a `RwLock<HashMap>` and vanish with the process. Useful for
//! ephemeral deployments and for exercising the orchestrator without disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use canopy_core::{CacheError, CacheResult, CacheRow, EpochMillis, StorageError};
use tracing::debug;

use super::store::{sort_by_frequency, sort_by_recency, CacheStore};

/// Volatile durable-tier backend.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    rows: RwLock<HashMap<String, CacheRow>>,
    initialized: AtomicBool,
}

impl MemoryCacheStore {
    /// Create an uninitialized store.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_initialized(&self) -> CacheResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::store_unavailable(
                "memory store not initialized",
            ))
        }
    }

    fn read(&self) -> CacheResult<RwLockReadGuard<'_, HashMap<String, CacheRow>>> {
        self.ensure_initialized()?;
        self.rows
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> CacheResult<RwLockWriteGuard<'_, HashMap<String, CacheRow>>> {
        self.ensure_initialized()?;
        self.rows
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn initialize(&self) -> CacheResult<()> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            debug!("Memory cache store initialized");
        }
        Ok(())
    }

    async fn upsert(&self, row: CacheRow) -> CacheResult<()> {
        let mut rows = self.write()?;
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> CacheResult<Option<CacheRow>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn update_stats(
        &self,
        key: &str,
        hit_count: u64,
        last_accessed_at: EpochMillis,
    ) -> CacheResult<()> {
        let mut rows = self.write()?;
        if let Some(row) = rows.get_mut(key) {
            row.hit_count = hit_count;
            row.last_accessed_at = last_accessed_at;
        }
        Ok(())
    }

    async fn record_hit(&self, key: &str, accessed_at: EpochMillis) -> CacheResult<()> {
        let mut rows = self.write()?;
        if let Some(row) = rows.get_mut(key) {
            row.hit_count = row.hit_count.saturating_add(1);
            row.last_accessed_at = accessed_at;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn delete_if_unchanged(&self, key: &str, seen: Option<&CacheRow>) -> CacheResult<bool> {
        let mut rows = self.write()?;
        // Rows here are always decodable, so only a matching write is removed.
        let unchanged = match (rows.get(key), seen) {
            (Some(current), Some(seen)) => current.same_write(seen),
            _ => false,
        };
        if unchanged {
            rows.remove(key);
        }
        Ok(unchanged)
    }

    async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let mut rows = self.write()?;
        let before = rows.len();
        rows.retain(|key, _| !key.contains(pattern));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_expired(&self, now: EpochMillis) -> CacheResult<u64> {
        let mut rows = self.write()?;
        let before = rows.len();
        rows.retain(|_, row| !row.is_expired(now));
        Ok((before - rows.len()) as u64)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>> {
        let mut rows: Vec<CacheRow> = self.read()?.values().cloned().collect();
        sort_by_frequency(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let rows = self.read()?;
        let mut keys: Vec<String> = rows
            .keys()
            .filter(|key| key.contains(pattern))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn count(&self) -> CacheResult<u64> {
        Ok(self.read()?.len() as u64)
    }

    async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>> {
        let mut pairs: Vec<(EpochMillis, String)> = self
            .read()?
            .values()
            .map(|row| (row.last_accessed_at, row.key.clone()))
            .collect();
        sort_by_recency(&mut pairs);
        Ok(pairs.into_iter().take(limit).map(|(_, key)| key).collect())
    }

    async fn flush(&self) -> CacheResult<()> {
        self.ensure_initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, now: EpochMillis, ttl_ms: i64) -> CacheRow {
        CacheRow::new(key, "\"v\"".to_string(), now, ttl_ms)
    }

    async fn ready() -> MemoryCacheStore {
        let store = MemoryCacheStore::new();
        store.initialize().await.expect("init");
        store
    }

    #[tokio::test]
    async fn test_calls_fail_before_initialize() {
        let store = MemoryCacheStore::new();
        let err = store.upsert(row("k", 0, 10)).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.fetch("k").await.unwrap_err().is_store_unavailable());
        assert!(store.count().await.unwrap_err().is_store_unavailable());
        assert!(store.flush().await.unwrap_err().is_store_unavailable());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = ready().await;
        store.upsert(row("k", 0, 10)).await.expect("upsert");
        store.initialize().await.expect("second init");
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = ready().await;
        store.upsert(row("k", 0, 10)).await.expect("upsert");
        let mut replacement = row("k", 5, 100);
        replacement.data = "\"w\"".to_string();
        store.upsert(replacement).await.expect("upsert");

        let fetched = store.fetch("k").await.expect("fetch").expect("row");
        assert_eq!(fetched.data, "\"w\"");
        assert_eq!(fetched.expires_at, 105);
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_update_stats_and_missing_key() {
        let store = ready().await;
        store.upsert(row("k", 0, 10)).await.expect("upsert");
        store.update_stats("k", 4, 9).await.expect("update");
        store.update_stats("gone", 1, 1).await.expect("missing key is ok");

        let fetched = store.fetch("k").await.expect("fetch").expect("row");
        assert_eq!(fetched.hit_count, 4);
        assert_eq!(fetched.last_accessed_at, 9);
    }

    #[tokio::test]
    async fn test_record_hit_increments_stored_count() {
        let store = ready().await;
        store.upsert(row("k", 0, 10)).await.expect("upsert");
        let stale = store.fetch("k").await.expect("fetch").expect("row");

        store.record_hit("k", 3).await.expect("hit");
        store.record_hit("k", 5).await.expect("hit");
        store.record_hit("gone", 5).await.expect("missing key is ok");

        let fetched = store.fetch("k").await.expect("fetch").expect("row");
        assert_eq!(stale.hit_count, 0);
        assert_eq!(fetched.hit_count, 2);
        assert_eq!(fetched.last_accessed_at, 5);
    }

    #[tokio::test]
    async fn test_delete_if_unchanged_spares_newer_write() {
        let store = ready().await;
        store.upsert(row("k", 0, 10)).await.expect("upsert");
        let seen = store.fetch("k").await.expect("fetch").expect("row");

        store.upsert(row("k", 20, 10)).await.expect("rewrite");
        assert!(!store.delete_if_unchanged("k", Some(&seen)).await.expect("delete"));
        assert!(store.fetch("k").await.expect("fetch").is_some());

        // A hit in between does not make the row a different write.
        let seen = store.fetch("k").await.expect("fetch").expect("row");
        store.record_hit("k", 25).await.expect("hit");
        assert!(store.delete_if_unchanged("k", Some(&seen)).await.expect("delete"));
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_delete_matching_and_keys_matching() {
        let store = ready().await;
        for key in ["owner:a:1", "owner:a:2", "owner:b:1", "plain"] {
            store.upsert(row(key, 0, 10)).await.expect("upsert");
        }
        assert_eq!(
            store.keys_matching("owner:a:").await.expect("keys"),
            vec!["owner:a:1".to_string(), "owner:a:2".to_string()]
        );
        assert_eq!(store.delete_matching("owner:a:").await.expect("delete"), 2);
        assert_eq!(store.count().await.expect("count"), 2);
        assert!(store.delete("plain").await.expect("delete"));
        assert!(!store.delete("plain").await.expect("delete"));
    }

    #[tokio::test]
    async fn test_delete_expired_uses_inclusive_bound() {
        let store = ready().await;
        store.upsert(row("a", 0, 100)).await.expect("upsert");
        store.upsert(row("b", 0, 200)).await.expect("upsert");
        assert_eq!(store.delete_expired(100).await.expect("prune"), 1);
        assert!(store.fetch("a").await.expect("fetch").is_none());
        assert!(store.fetch("b").await.expect("fetch").is_some());
    }

    #[tokio::test]
    async fn test_frequency_and_recency_queries() {
        let store = ready().await;
        for (key, hits, accessed) in [("a", 1, 30), ("b", 7, 10), ("c", 3, 20)] {
            let mut r = row(key, 0, 1_000);
            r.hit_count = hits;
            r.last_accessed_at = accessed;
            store.upsert(r).await.expect("upsert");
        }

        let top: Vec<String> = store
            .most_frequently_used(2)
            .await
            .expect("mfu")
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(top, vec!["b".to_string(), "c".to_string()]);

        assert_eq!(
            store.least_recently_used(2).await.expect("lru"),
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_clear() {
        let store = ready().await;
        store.upsert(row("a", 0, 10)).await.expect("upsert");
        store.clear().await.expect("clear");
        assert_eq!(store.count().await.expect("count"), 0);
    }
}
