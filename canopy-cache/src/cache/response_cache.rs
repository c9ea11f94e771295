//! Two-tier response cache.
//!
//! [`ResponseCache`] composes a [`FastTier`] holding decoded JSON values with
//! a [`DurableTier`] over any [`CacheStore`]. Reads try the fast tier first
//! and promote durable hits; writes go to the durable tier first so a failed
//! durable write never leaves a fast-only entry behind.
//!
//! # Expiry
//!
//! An entry's absolute expiry is fixed when it is written. Promotion copies
//! the remaining lifetime, not the original TTL, so moving between tiers
//! never extends an entry.
//!
//! # Concurrency
//!
//! `set`, `delete` and the fetch-then-promote half of `get` hold a per-key
//! lock, so a read can never put back a value that a write on the same key
//! already replaced or removed. Invalidations reach the durable tier before
//! the fast tier. Bulk invalidations advance the fast tier's generation and
//! a promotion that started before one is dropped.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use canopy_cache::cache::{MemoryCacheStore, ResponseCache};
//! use canopy_core::{CacheSettings, SystemClock};
//!
//! let cache = ResponseCache::new(
//!     Arc::new(MemoryCacheStore::new()),
//!     Arc::new(SystemClock),
//!     &CacheSettings::default(),
//! );
//! cache.initialize().await?;
//!
//! let key = cache.derive_key(&request, Some("user-42"))?;
//! if let Some(hit) = cache.get::<Recommendations>(&key).await? {
//!     return Ok(hit);
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use canopy_core::{
    derive_key, owner_prefix, CacheError, CacheMode, CachePayload, CacheResult, CacheRow,
    CacheSettings, Clock, SystemClock,
};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::durable_tier::DurableTier;
use super::fast_tier::FastTier;
use super::key_lock::KeyLocks;
use super::lmdb_store::LmdbCacheStore;
use super::store::CacheStore;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Reads served by the fast tier.
    pub fast_hits: u64,
    /// Reads served by the durable tier (and promoted).
    pub durable_hits: u64,
    pub misses: u64,
    /// Fast tier entries removed for capacity.
    pub evictions: u64,
    /// Entries currently in the fast tier.
    pub fast_entries: usize,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.fast_hits + self.durable_hits
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// Entries removed by one [`ResponseCache::prune_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub fast_removed: usize,
    pub durable_removed: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.fast_removed as u64 + self.durable_removed
    }
}

#[derive(Debug, Default)]
struct Counters {
    fast_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct RuntimeConfig {
    mode: CacheMode,
    default_ttl: Duration,
}

/// Read-through, write-through cache over a fast and a durable tier.
pub struct ResponseCache<S> {
    fast: FastTier<Value>,
    durable: DurableTier<S>,
    locks: KeyLocks,
    clock: Arc<dyn Clock>,
    config: RwLock<RuntimeConfig>,
    warm_up_count: usize,
    counters: Counters,
}

impl ResponseCache<LmdbCacheStore> {
    /// Build an LMDB-backed cache on the system clock.
    ///
    /// The store is not opened until [`ResponseCache::initialize`].
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let store = LmdbCacheStore::new(&settings.store.path, settings.store.map_size_mb);
        Self::new(Arc::new(store), Arc::new(SystemClock), settings)
    }
}

impl<S: CacheStore> ResponseCache<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: &CacheSettings) -> Self {
        Self {
            fast: FastTier::new(settings.max_size, clock.clone()),
            durable: DurableTier::new(store, clock.clone()),
            locks: KeyLocks::new(),
            clock,
            config: RwLock::new(RuntimeConfig {
                mode: settings.mode(),
                default_ttl: settings.default_ttl(),
            }),
            warm_up_count: settings.warm_up_count,
            counters: Counters::default(),
        }
    }

    fn runtime(&self) -> RuntimeConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> CacheMode {
        self.runtime().mode
    }

    pub fn default_ttl(&self) -> Duration {
        self.runtime().default_ttl
    }

    pub fn fast_tier(&self) -> &FastTier<Value> {
        &self.fast
    }

    pub fn durable_tier(&self) -> &DurableTier<S> {
        &self.durable
    }

    /// Change runtime behaviour. `None` leaves a setting unchanged.
    pub fn configure(&self, enabled: bool, default_ttl: Option<Duration>, max_size: Option<usize>) {
        {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.mode = CacheMode::from_enabled(enabled);
            if let Some(ttl) = default_ttl {
                config.default_ttl = ttl;
            }
        }
        if let Some(max_size) = max_size {
            self.fast.set_max_size(max_size);
        }

        let config = self.runtime();
        info!(
            enabled,
            default_ttl_ms = config.default_ttl.as_millis() as u64,
            max_size = self.fast.max_size(),
            "Response cache configured"
        );
    }

    pub fn derive_key<P>(&self, payload: &P, owner_id: Option<&str>) -> CacheResult<String>
    where
        P: Serialize + ?Sized,
    {
        derive_key(payload, owner_id)
    }

    /// Open the durable store, drop expired rows and warm the fast tier with
    /// the most frequently used rows. Returns how many entries were warmed.
    pub async fn initialize(&self) -> CacheResult<usize> {
        self.durable.initialize().await?;
        let expired = self.durable.delete_expired().await?;

        if !self.mode().is_enabled() {
            info!(expired, "Response cache initialized (disabled, warm-up skipped)");
            return Ok(0);
        }

        let limit = self.warm_up_count.min(self.fast.max_size());
        let rows = self.durable.most_frequently_used(limit).await?;
        let mut warmed = 0usize;
        // Least used first, so the hottest rows are the most recently touched.
        for row in rows.into_iter().rev() {
            if self.warm_row(row) {
                warmed += 1;
            }
        }

        info!(expired, warmed, "Response cache initialized");
        Ok(warmed)
    }

    fn warm_row(&self, row: CacheRow) -> bool {
        let remaining = row.expires_at - self.clock.now_ms();
        if remaining <= 0 {
            return false;
        }
        match serde_json::from_str::<Value>(&row.data) {
            Ok(value) => {
                self.fast
                    .set(&row.key, value, Duration::from_millis(remaining as u64));
                true
            }
            Err(e) => {
                warn!(key = %row.key, error = %e, "Skipping undecodable row during warm-up");
                false
            }
        }
    }

    /// Flush the durable store and empty the fast tier.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.durable.flush().await?;
        let dropped = self.fast.clear();
        info!(dropped, "Response cache shut down");
        Ok(())
    }

    /// Look up a cached response.
    ///
    /// Durable-tier failures are logged and reported as a miss; this only
    /// returns `Ok`.
    pub async fn get<T: CachePayload>(&self, key: &str) -> CacheResult<Option<T>> {
        if !self.mode().is_enabled() {
            debug!(key = %key, "Cache disabled, skipping lookup");
            return Ok(None);
        }

        if let Some(entry) = self.fast.get(key) {
            if entry.is_expired(self.clock.now_ms()) {
                debug!(key = %key, "Fast entry expired");
                self.fast.delete_if_expired(key);
            } else {
                match serde_json::from_value::<T>(entry.payload) {
                    Ok(value) => {
                        self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(value));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Fast entry did not decode, dropping");
                        self.fast.delete(key);
                    }
                }
            }
        }

        let _guard = self.locks.lock(key).await;
        let generation = self.fast.generation();
        match self.durable.get::<T>(key).await {
            Some(hit) => {
                self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
                self.promote(key, &hit.value, hit.expires_at, generation);
                Ok(Some(hit.value))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn promote<T: CachePayload>(&self, key: &str, value: &T, expires_at: i64, generation: u64) {
        let remaining = expires_at - self.clock.now_ms();
        if remaining <= 0 {
            return;
        }
        match serde_json::to_value(value) {
            Ok(value) => {
                let ttl = Duration::from_millis(remaining as u64);
                if self.fast.set_if_generation(key, value, ttl, generation) {
                    debug!(key = %key, remaining_ms = remaining, "Promoted durable hit");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to promote durable hit"),
        }
    }

    /// Write a response to both tiers.
    ///
    /// The durable write happens first; if it fails the fast tier is left
    /// untouched and the error is returned. A no-op while disabled.
    pub async fn set<T: CachePayload>(&self, key: &str, data: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let config = self.runtime();
        if !config.mode.is_enabled() {
            debug!(key = %key, "Cache disabled, skipping store");
            return Ok(());
        }

        let ttl = ttl.unwrap_or(config.default_ttl);
        let value = serde_json::to_value(data).map_err(|e| CacheError::serialization(key, e))?;
        let _guard = self.locks.lock(key).await;
        self.durable.set_value(key, &value, ttl).await?;
        self.fast.set(key, value, ttl);
        Ok(())
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// Concurrent misses on the same key each run `compute`; the last write
    /// wins. A failure to store the computed value is logged, not returned.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: CachePayload,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await? {
            return Ok(hit);
        }

        let value = compute().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            warn!(key = %key, error = %e, "Failed to cache computed value");
        }
        Ok(value)
    }

    /// Remove one key from both tiers. Returns whether either tier held it.
    ///
    /// The fast copy is dropped even if the durable delete fails.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let _guard = self.locks.lock(key).await;
        let in_durable = self.durable.delete(key).await;
        let in_fast = self.fast.delete(key);
        Ok(in_durable? || in_fast)
    }

    /// Empty both tiers.
    pub async fn clear(&self) -> CacheResult<()> {
        let durable = self.durable.clear().await;
        let dropped = self.fast.clear();
        durable?;
        info!(fast_dropped = dropped, "Response cache cleared");
        Ok(())
    }

    /// Remove every key containing `pattern` from both tiers.
    ///
    /// `pattern` is a literal substring, never a regex. Returns the number of
    /// durable rows removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let regex = Regex::new(&regex::escape(pattern))
            .map_err(|e| CacheError::invalid_argument("pattern", e.to_string()))?;
        let durable_removed = self.durable.delete_by_pattern(pattern).await;
        let fast_removed = self.fast.delete_by_pattern(&regex);
        let durable_removed = durable_removed?;

        info!(
            pattern = %pattern,
            fast_removed,
            durable_removed,
            "Deleted cache entries by pattern"
        );
        Ok(durable_removed)
    }

    /// Remove every entry derived for `owner_id`.
    pub async fn delete_for_owner(&self, owner_id: &str) -> CacheResult<u64> {
        let prefix = owner_prefix(owner_id)?;
        self.delete_by_pattern(&prefix).await
    }

    /// Drop expired entries from both tiers.
    pub async fn prune_expired(&self) -> CacheResult<PruneReport> {
        let fast_removed = self.fast.delete_expired();
        let durable_removed = self.durable.delete_expired().await?;
        let report = PruneReport {
            fast_removed,
            durable_removed,
        };
        debug!(fast_removed, durable_removed, "Pruned expired entries");
        Ok(report)
    }

    pub async fn keys_for_owner(&self, owner_id: &str) -> CacheResult<Vec<String>> {
        self.durable.keys_for_owner(owner_id).await
    }

    pub async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>> {
        self.durable.most_frequently_used(limit).await
    }

    pub async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>> {
        self.durable.least_recently_used(limit).await
    }

    /// Rows currently held by the durable tier.
    pub async fn durable_count(&self) -> CacheResult<u64> {
        self.durable.count().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fast_hits: self.counters.fast_hits.load(Ordering::Relaxed),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.fast.evictions(),
            fast_entries: self.fast.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store::MemoryCacheStore;
    use canopy_core::ManualClock;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reply {
        strains: Vec<String>,
    }

    fn reply(name: &str) -> Reply {
        Reply {
            strains: vec![name.to_string()],
        }
    }

    async fn cache_with(settings: CacheSettings) -> (ResponseCache<MemoryCacheStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = ResponseCache::new(
            Arc::new(MemoryCacheStore::new()),
            clock.clone() as Arc<dyn Clock>,
            &settings,
        );
        cache.initialize().await.expect("init");
        (cache, clock)
    }

    async fn cache() -> (ResponseCache<MemoryCacheStore>, Arc<ManualClock>) {
        cache_with(CacheSettings::default()).await
    }

    #[tokio::test]
    async fn test_set_get_fast_hit() {
        let (cache, _) = cache().await;
        cache.set("k", &reply("a"), None).await.expect("set");

        assert_eq!(cache.get::<Reply>("k").await.expect("get"), Some(reply("a")));
        let stats = cache.stats();
        assert_eq!(stats.fast_hits, 1);
        assert_eq!(stats.durable_hits, 0);
        assert_eq!(stats.fast_entries, 1);
    }

    #[tokio::test]
    async fn test_miss_counts() {
        let (cache, _) = cache().await;
        assert!(cache.get::<Reply>("absent").await.expect("get").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let (cache, clock) = cache_with(CacheSettings::default().with_ttl(Duration::from_secs(10))).await;
        cache.set("k", &reply("a"), None).await.expect("set");

        clock.advance(Duration::from_secs(9));
        assert!(cache.get::<Reply>("k").await.expect("get").is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get::<Reply>("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_durable_hit_promotes_with_remaining_ttl() {
        let (cache, clock) = cache().await;
        cache
            .set("k", &reply("a"), Some(Duration::from_millis(1_000)))
            .await
            .expect("set");
        cache.fast_tier().clear();
        clock.advance(Duration::from_millis(300));

        assert_eq!(cache.get::<Reply>("k").await.expect("get"), Some(reply("a")));
        let promoted = cache.fast_tier().peek("k").expect("promoted");
        assert_eq!(promoted.expires_at, 1_001_000);
        assert_eq!(cache.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_undecodable_fast_entry_falls_through() {
        let (cache, _) = cache().await;
        cache.set("k", &reply("a"), None).await.expect("set");
        // Replace the fast copy with a shape `Reply` cannot decode.
        cache
            .fast_tier()
            .set("k", json!(42), Duration::from_secs(60));

        assert_eq!(cache.get::<Reply>("k").await.expect("get"), Some(reply("a")));
        assert_eq!(cache.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_disabled_mode() {
        let (cache, _) = cache().await;
        cache.set("k", &reply("a"), None).await.expect("set");
        cache.configure(false, None, None);

        assert_eq!(cache.mode(), CacheMode::Disabled);
        assert!(cache.get::<Reply>("k").await.expect("get").is_none());
        cache.set("other", &reply("b"), None).await.expect("set is a no-op");
        assert_eq!(cache.durable_count().await.expect("count"), 1);

        // Invalidation still runs while disabled.
        assert!(cache.delete("k").await.expect("delete"));
        assert_eq!(cache.durable_count().await.expect("count"), 0);

        cache.configure(true, None, None);
        assert!(cache.get::<Reply>("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_configure_updates_ttl_and_capacity() {
        let (cache, _) = cache().await;
        for i in 0..5 {
            cache.set(&format!("k{i}"), &reply("a"), None).await.expect("set");
        }
        cache.configure(true, Some(Duration::from_secs(5)), Some(2));

        assert_eq!(cache.default_ttl(), Duration::from_secs(5));
        assert_eq!(cache.fast_tier().max_size(), 2);
        assert_eq!(cache.stats().fast_entries, 2);
        assert_eq!(cache.durable_count().await.expect("count"), 5);
    }

    #[tokio::test]
    async fn test_null_payload_rejected_before_fast_write() {
        let (cache, _) = cache().await;
        let err = cache
            .set("k", &Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument { .. }));
        assert!(!cache.fast_tier().contains("k"));
    }

    #[tokio::test]
    async fn test_delete_by_pattern_is_literal() {
        let (cache, _) = cache().await;
        cache.set("a.b", &reply("x"), None).await.expect("set");
        cache.set("axb", &reply("y"), None).await.expect("set");

        assert_eq!(cache.delete_by_pattern("a.b").await.expect("delete"), 1);
        assert!(!cache.fast_tier().contains("a.b"));
        assert!(cache.fast_tier().contains("axb"));
    }

    #[tokio::test]
    async fn test_delete_for_owner_validates_id() {
        let (cache, _) = cache().await;
        assert!(matches!(
            cache.delete_for_owner("").await,
            Err(CacheError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune_expired_reports_both_tiers() {
        let (cache, clock) = cache().await;
        cache
            .set("short", &reply("a"), Some(Duration::from_millis(10)))
            .await
            .expect("set");
        cache.set("long", &reply("b"), None).await.expect("set");
        clock.advance(Duration::from_millis(10));

        let report = cache.prune_expired().await.expect("prune");
        assert_eq!(report.fast_removed, 1);
        assert_eq!(report.durable_removed, 1);
        assert_eq!(report.total(), 2);
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once_per_miss() {
        let (cache, _) = cache().await;
        let calls = AtomicU64::new(0);

        for _ in 0..3 {
            let value: Result<Reply, CacheError> = cache
                .get_or_compute("k", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(reply("computed"))
                })
                .await;
            assert_eq!(value.expect("value"), reply("computed"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_propagates_compute_error() {
        let (cache, _) = cache().await;
        let result: Result<Reply, CacheError> = cache
            .get_or_compute("k", None, || async {
                Err(CacheError::invalid_argument("upstream", "model timed out"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.durable_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_initialize_warms_most_used_rows() {
        let store = Arc::new(MemoryCacheStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let settings = CacheSettings::default().with_warm_up_count(1);

        {
            let first = ResponseCache::new(store.clone(), clock.clone() as Arc<dyn Clock>, &settings);
            first.initialize().await.expect("init");
            first.set("cold", &reply("c"), None).await.expect("set");
            first.set("hot", &reply("h"), None).await.expect("set");
            first.fast_tier().clear();
            for _ in 0..2 {
                first.get::<Reply>("hot").await.expect("get");
                first.fast_tier().clear();
            }
        }

        let second = ResponseCache::new(store, clock as Arc<dyn Clock>, &settings);
        assert_eq!(second.initialize().await.expect("init"), 1);
        assert!(second.fast_tier().contains("hot"));
        assert!(!second.fast_tier().contains("cold"));
    }

    #[tokio::test]
    async fn test_shutdown_clears_fast_tier() {
        let (cache, _) = cache().await;
        cache.set("k", &reply("a"), None).await.expect("set");
        cache.shutdown().await.expect("shutdown");
        assert!(cache.fast_tier().is_empty());
        assert_eq!(cache.durable_count().await.expect("count"), 1);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            fast_hits: 2,
            durable_hits: 1,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hits(), 3);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
