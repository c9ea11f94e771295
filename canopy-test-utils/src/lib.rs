//! Canopy Test Utilities
//!
//! Shared test infrastructure for the Canopy workspace:
//! - Proptest generators for recommendation payloads and owner ids
//! - Fixtures shaped like real recommendation traffic
//! - Harnesses that build a cache on a manual clock, including a store
//!   wrapper that can pause a read mid-flight
//! - Assertions for cache error variants

pub use canopy_cache::{CacheStore, LmdbCacheStore, MemoryCacheStore, ResponseCache};
pub use canopy_core::{
    CacheError, CacheResult, CacheRow, CacheSettings, Clock, EpochMillis, ManualClock,
    StorageError,
};
pub use harness::{GatedStore, PausedFetch};

use serde::{Deserialize, Serialize};

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// A recommendation request as the service receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub effects: Vec<String>,
    pub experience_level: String,
    pub consumption_method: Option<String>,
    pub budget: Option<u32>,
}

/// One suggested product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub strain: String,
    pub reason: String,
    pub match_score: u8,
}

/// The model output that gets cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub recommendations: Vec<Recommendation>,
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache payloads.

    use super::*;
    use proptest::prelude::*;

    /// Owner ids accepted by the key deriver.
    pub fn arb_owner_id() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9_-]{0,15}"
    }

    pub fn arb_effect() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "calm", "sleep", "focus", "energy", "appetite", "pain-relief", "creativity",
        ])
        .prop_map(str::to_string)
    }

    pub fn arb_request() -> impl Strategy<Value = RecommendationRequest> {
        (
            prop::collection::vec(arb_effect(), 1..4),
            prop::sample::select(vec!["novice", "intermediate", "experienced"]),
            prop::option::of(prop::sample::select(vec!["flower", "edible", "vape"])),
            prop::option::of(10u32..200),
        )
            .prop_map(|(effects, level, method, budget)| RecommendationRequest {
                effects,
                experience_level: level.to_string(),
                consumption_method: method.map(str::to_string),
                budget,
            })
    }

    pub fn arb_recommendation() -> impl Strategy<Value = Recommendation> {
        ("[A-Z][a-z]{2,10} [A-Z][a-z]{2,10}", "[a-z ]{5,40}", 0u8..=100).prop_map(
            |(strain, reason, match_score)| Recommendation {
                strain,
                reason,
                match_score,
            },
        )
    }

    pub fn arb_response() -> impl Strategy<Value = RecommendationResponse> {
        prop::collection::vec(arb_recommendation(), 1..5)
            .prop_map(|recommendations| RecommendationResponse { recommendations })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built payloads for common scenarios.

    use super::*;

    pub fn sleep_request() -> RecommendationRequest {
        RecommendationRequest {
            effects: vec!["sleep".to_string(), "calm".to_string()],
            experience_level: "novice".to_string(),
            consumption_method: Some("edible".to_string()),
            budget: Some(40),
        }
    }

    pub fn focus_request() -> RecommendationRequest {
        RecommendationRequest {
            effects: vec!["focus".to_string()],
            experience_level: "experienced".to_string(),
            consumption_method: None,
            budget: None,
        }
    }

    pub fn sample_response(strain: &str) -> RecommendationResponse {
        RecommendationResponse {
            recommendations: vec![Recommendation {
                strain: strain.to_string(),
                reason: "matches requested effects".to_string(),
                match_score: 87,
            }],
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub mod harness {
    //! Caches wired to a [`ManualClock`] for deterministic expiry.

    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Starting time for harness clocks.
    pub const TEST_EPOCH_MS: EpochMillis = 1_700_000_000_000;

    /// A cache plus handles to its store and clock.
    pub struct TestCache<S> {
        pub cache: Arc<ResponseCache<S>>,
        pub store: Arc<S>,
        pub clock: Arc<ManualClock>,
        // Held so the LMDB directory outlives the cache.
        _dir: Option<TempDir>,
    }

    impl<S> TestCache<S> {
        pub fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }

        pub fn advance_ms(&self, ms: u64) {
            self.clock.advance(Duration::from_millis(ms));
        }
    }

    /// Settings for harness caches: small capacity, no warm-up.
    pub fn test_settings() -> CacheSettings {
        CacheSettings::default()
            .with_max_size(8)
            .with_warm_up_count(0)
    }

    /// Memory-backed cache, not yet initialized.
    pub fn memory_cache_uninit(settings: &CacheSettings) -> TestCache<MemoryCacheStore> {
        let store = Arc::new(MemoryCacheStore::new());
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let cache = ResponseCache::new(store.clone(), clock.clone() as Arc<dyn Clock>, settings);
        TestCache {
            cache: Arc::new(cache),
            store,
            clock,
            _dir: None,
        }
    }

    /// Memory-backed cache, initialized.
    pub async fn memory_cache(settings: &CacheSettings) -> CacheResult<TestCache<MemoryCacheStore>> {
        let harness = memory_cache_uninit(settings);
        harness.cache.initialize().await?;
        Ok(harness)
    }

    /// Memory-backed cache over a [`GatedStore`], initialized.
    pub async fn gated_cache(
        settings: &CacheSettings,
    ) -> CacheResult<TestCache<GatedStore<MemoryCacheStore>>> {
        let store = Arc::new(GatedStore::new(MemoryCacheStore::new()));
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let cache = ResponseCache::new(store.clone(), clock.clone() as Arc<dyn Clock>, settings);
        cache.initialize().await?;
        Ok(TestCache {
            cache: Arc::new(cache),
            store,
            clock,
            _dir: None,
        })
    }

    /// LMDB-backed cache in a fresh temporary directory, initialized.
    pub async fn lmdb_cache(settings: &CacheSettings) -> CacheResult<TestCache<LmdbCacheStore>> {
        let dir = TempDir::new().map_err(|e| CacheError::store_unavailable(e.to_string()))?;
        let store = Arc::new(LmdbCacheStore::new(dir.path(), 16));
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let cache = ResponseCache::new(store.clone(), clock.clone() as Arc<dyn Clock>, settings);
        cache.initialize().await?;
        Ok(TestCache {
            cache: Arc::new(cache),
            store,
            clock,
            _dir: Some(dir),
        })
    }

    struct FetchGate {
        key: String,
        reached: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    }

    /// Handles for a fetch paused by [`GatedStore::pause_after_fetch`].
    pub struct PausedFetch {
        /// Resolves once the fetch has read its row and is waiting.
        pub reached: oneshot::Receiver<()>,
        /// Send (or drop) to let the fetch return.
        pub release: oneshot::Sender<()>,
    }

    /// Store wrapper that can hold one fetch open after it has read, so a
    /// test can run other operations while that read is in flight.
    pub struct GatedStore<S> {
        inner: S,
        gate: Mutex<Option<FetchGate>>,
    }

    impl<S> GatedStore<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                gate: Mutex::new(None),
            }
        }

        pub fn inner(&self) -> &S {
            &self.inner
        }

        /// The next fetch of `key` reads its row, then waits for release.
        pub fn pause_after_fetch(&self, key: &str) -> PausedFetch {
            let (reached_tx, reached_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(FetchGate {
                key: key.to_string(),
                reached: reached_tx,
                release: release_rx,
            });
            PausedFetch {
                reached: reached_rx,
                release: release_tx,
            }
        }

        fn take_gate(&self, key: &str) -> Option<FetchGate> {
            let mut slot = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().map(|gate| gate.key == key).unwrap_or(false) {
                slot.take()
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl<S: CacheStore> CacheStore for GatedStore<S> {
        async fn initialize(&self) -> CacheResult<()> {
            self.inner.initialize().await
        }

        async fn upsert(&self, row: CacheRow) -> CacheResult<()> {
            self.inner.upsert(row).await
        }

        async fn fetch(&self, key: &str) -> CacheResult<Option<CacheRow>> {
            let result = self.inner.fetch(key).await;
            if let Some(gate) = self.take_gate(key) {
                let _ = gate.reached.send(());
                let _ = gate.release.await;
            }
            result
        }

        async fn update_stats(
            &self,
            key: &str,
            hit_count: u64,
            last_accessed_at: EpochMillis,
        ) -> CacheResult<()> {
            self.inner.update_stats(key, hit_count, last_accessed_at).await
        }

        async fn record_hit(&self, key: &str, accessed_at: EpochMillis) -> CacheResult<()> {
            self.inner.record_hit(key, accessed_at).await
        }

        async fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key).await
        }

        async fn delete_if_unchanged(&self, key: &str, seen: Option<&CacheRow>) -> CacheResult<bool> {
            self.inner.delete_if_unchanged(key, seen).await
        }

        async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
            self.inner.delete_matching(pattern).await
        }

        async fn delete_expired(&self, now: EpochMillis) -> CacheResult<u64> {
            self.inner.delete_expired(now).await
        }

        async fn clear(&self) -> CacheResult<()> {
            self.inner.clear().await
        }

        async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>> {
            self.inner.most_frequently_used(limit).await
        }

        async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
            self.inner.keys_matching(pattern).await
        }

        async fn count(&self) -> CacheResult<u64> {
            self.inner.count().await
        }

        async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>> {
            self.inner.least_recently_used(limit).await
        }

        async fn flush(&self) -> CacheResult<()> {
            self.inner.flush().await
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache error variants.

    use super::*;

    /// Assert that a CacheResult is a StoreUnavailable error.
    #[track_caller]
    pub fn assert_store_unavailable<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::StoreUnavailable { .. }) => {}
            other => panic!("Expected StoreUnavailable, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is an InvalidArgument error for `field`.
    #[track_caller]
    pub fn assert_invalid_argument<T: std::fmt::Debug>(result: &CacheResult<T>, field: &str) {
        match result {
            Err(CacheError::InvalidArgument { field: f, .. }) => {
                assert_eq!(f, field, "Wrong field in InvalidArgument error");
            }
            other => panic!("Expected InvalidArgument({}), got: {:?}", field, other),
        }
    }
}
