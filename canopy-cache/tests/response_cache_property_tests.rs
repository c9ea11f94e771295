use std::time::Duration;

use canopy_cache::CacheStore;
use canopy_core::{derive_key, owner_prefix, CacheError, CacheRow, CacheSettings, Clock};
use canopy_test_utils::assertions::{assert_invalid_argument, assert_store_unavailable};
use canopy_test_utils::fixtures::{focus_request, sample_response, sleep_request};
use canopy_test_utils::generators::{arb_owner_id, arb_request, arb_response};
use canopy_test_utils::harness::{memory_cache, memory_cache_uninit, test_settings, TEST_EPOCH_MS};
use canopy_test_utils::RecommendationResponse;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

#[tokio::test]
async fn ttl_hit_before_expiry_miss_after() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    let key = derive_key(&sleep_request(), None).expect("key");
    h.cache
        .set(&key, &sample_response("Granddaddy Purple"), Some(Duration::from_millis(100)))
        .await
        .expect("set");

    h.advance_ms(50);
    assert_eq!(
        h.cache.get::<RecommendationResponse>(&key).await.expect("get"),
        Some(sample_response("Granddaddy Purple"))
    );

    h.advance_ms(100);
    assert!(h.cache.get::<RecommendationResponse>(&key).await.expect("get").is_none());
    assert!(!h.cache.fast_tier().contains(&key));
    assert!(h.store.fetch(&key).await.expect("fetch").is_none());
}

#[tokio::test]
async fn capacity_evicts_lowest_score_but_durable_keeps_all() {
    let settings = test_settings().with_max_size(3);
    let h = memory_cache(&settings).await.expect("harness");

    for name in ["a", "b", "c"] {
        h.cache.set(name, &sample_response(name), None).await.expect("set");
        h.advance_ms(1_000);
    }
    // b and c get read; a never does.
    for name in ["b", "c", "b"] {
        h.cache.get::<RecommendationResponse>(name).await.expect("get");
    }
    h.advance_ms(1_000);
    h.cache.set("d", &sample_response("d"), None).await.expect("set");

    let fast = h.cache.fast_tier();
    assert_eq!(fast.len(), 3);
    assert!(!fast.contains("a"));
    assert_eq!(h.cache.stats().evictions, 1);

    // The evicted entry is still served, now from the durable tier.
    assert_eq!(
        h.cache.get::<RecommendationResponse>("a").await.expect("get"),
        Some(sample_response("a"))
    );
    assert_eq!(h.cache.durable_count().await.expect("count"), 4);
}

#[tokio::test]
async fn promotion_preserves_absolute_expiry() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    h.cache
        .set("k", &sample_response("Sour Diesel"), Some(Duration::from_millis(1_000)))
        .await
        .expect("set");

    h.advance_ms(200);
    assert!(h.cache.fast_tier().delete("k"));
    h.advance_ms(100);

    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_some());
    let promoted = h.cache.fast_tier().peek("k").expect("promoted");
    assert_eq!(promoted.expires_at, TEST_EPOCH_MS + 1_000);

    h.advance_ms(699);
    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_some());
    h.advance_ms(1);
    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_none());
}

#[tokio::test]
async fn write_through_survives_fast_tier_clear() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    let key = derive_key(&focus_request(), Some("user-1")).expect("key");
    h.cache.set(&key, &sample_response("Jack Herer"), None).await.expect("set");

    h.cache.fast_tier().clear();
    assert_eq!(
        h.cache.get::<RecommendationResponse>(&key).await.expect("get"),
        Some(sample_response("Jack Herer"))
    );
    let stats = h.cache.stats();
    assert_eq!(stats.durable_hits, 1);
    assert_eq!(stats.fast_entries, 1);
}

#[tokio::test]
async fn owner_deletion_is_isolated() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    let requests = [sleep_request(), focus_request()];

    for owner in ["u1", "u2"] {
        for request in &requests {
            let key = derive_key(request, Some(owner)).expect("key");
            h.cache.set(&key, &sample_response(owner), None).await.expect("set");
        }
    }
    let anonymous = derive_key(&sleep_request(), None).expect("key");
    h.cache.set(&anonymous, &sample_response("anon"), None).await.expect("set");

    assert_eq!(h.cache.delete_for_owner("u1").await.expect("delete"), 2);
    assert!(h.cache.keys_for_owner("u1").await.expect("keys").is_empty());
    assert_eq!(h.cache.keys_for_owner("u2").await.expect("keys").len(), 2);

    let prefix = owner_prefix("u1").expect("prefix");
    assert!(h.cache.fast_tier().keys().iter().all(|k| !k.starts_with(&prefix)));
    assert!(h.cache.get::<RecommendationResponse>(&anonymous).await.expect("get").is_some());
}

#[tokio::test]
async fn owner_prefix_does_not_match_longer_owner() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    let short = derive_key(&sleep_request(), Some("u1")).expect("key");
    let long = derive_key(&sleep_request(), Some("u10")).expect("key");
    h.cache.set(&short, &sample_response("x"), None).await.expect("set");
    h.cache.set(&long, &sample_response("y"), None).await.expect("set");

    assert_eq!(h.cache.delete_for_owner("u1").await.expect("delete"), 1);
    assert!(h.cache.get::<RecommendationResponse>(&long).await.expect("get").is_some());
}

#[tokio::test]
async fn corrupt_durable_row_self_heals() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    let row = CacheRow::new("broken", "{\"recommendations\":".to_string(), h.clock.now_ms(), 60_000);
    h.store.upsert(row).await.expect("upsert");

    assert!(h.cache.get::<RecommendationResponse>("broken").await.expect("get").is_none());
    assert!(h.store.fetch("broken").await.expect("fetch").is_none());
    assert_eq!(h.cache.stats().misses, 1);
}

#[tokio::test]
async fn disabled_cache_misses_and_skips_writes() {
    let settings = test_settings().with_enabled(false);
    let h = memory_cache(&settings).await.expect("harness");

    h.cache.set("k", &sample_response("x"), None).await.expect("set");
    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_none());
    assert_eq!(h.store.count().await.expect("count"), 0);

    h.cache.configure(true, None, None);
    h.cache.set("k", &sample_response("x"), None).await.expect("set");
    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_some());
}

#[tokio::test]
async fn writes_fail_and_reads_miss_before_initialize() {
    let h = memory_cache_uninit(&CacheSettings::default());

    assert_store_unavailable(&h.cache.set("k", &sample_response("x"), None).await);
    assert!(!h.cache.fast_tier().contains("k"));
    assert!(h.cache.get::<RecommendationResponse>("k").await.expect("get").is_none());
    assert_store_unavailable(&h.cache.delete("k").await);
    assert_store_unavailable(&h.cache.prune_expired().await);

    h.cache.initialize().await.expect("init");
    h.cache.set("k", &sample_response("x"), None).await.expect("set");
}

#[tokio::test]
async fn invalid_owner_ids_are_rejected() {
    let h = memory_cache(&test_settings()).await.expect("harness");
    assert_invalid_argument(&h.cache.delete_for_owner("a:b").await, "owner_id");
    assert_invalid_argument(&h.cache.keys_for_owner("").await, "owner_id");
    assert!(matches!(
        h.cache.derive_key(&sleep_request(), Some("x:y")),
        Err(CacheError::InvalidArgument { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Equal requests derive equal keys; owners never share keys.
    #[test]
    fn prop_key_determinism(request in arb_request(), a in arb_owner_id(), b in arb_owner_id()) {
        let again = request.clone();
        prop_assert_eq!(
            derive_key(&request, Some(a.as_str())).expect("key"),
            derive_key(&again, Some(a.as_str())).expect("key")
        );
        if a != b {
            prop_assert_ne!(
                derive_key(&request, Some(a.as_str())).expect("key"),
                derive_key(&request, Some(b.as_str())).expect("key")
            );
        }
    }

    /// Whatever is written can be read back, and the fast tier stays within
    /// capacity.
    #[test]
    fn prop_round_trip_within_capacity(
        writes in prop::collection::vec((arb_request(), arb_response()), 1..20),
        max_size in 1usize..6,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let h = memory_cache(&test_settings().with_max_size(max_size))
                .await
                .expect("harness");

            for (request, response) in &writes {
                let key = derive_key(request, None).expect("key");
                h.cache.set(&key, response, None).await.expect("set");
                h.advance_ms(10);
                assert!(h.cache.fast_tier().len() <= max_size);
            }

            // Later writes for the same request win.
            let (request, response) = writes.last().expect("non-empty");
            let key = derive_key(request, None).expect("key");
            assert_eq!(
                h.cache.get::<RecommendationResponse>(&key).await.expect("get"),
                Some(response.clone())
            );
        });
    }
}
