//! Canopy Cache - two-tier response cache for the recommendation service
//!
//! Repeated recommendation requests are answered from a bounded in-memory
//! tier backed by an LMDB row store that survives restarts. Shared types
//! (errors, settings, keys, entries) live in `canopy-core`.

pub mod cache;
pub mod prune_task;

pub use cache::{
    CacheStats, CacheStore, DurableHit, DurableTier, FastTier, LmdbCacheError, LmdbCacheStore,
    MemoryCacheStore, PruneReport, ResponseCache, MAX_KEY_BYTES,
};
pub use prune_task::{prune_task, spawn_prune_task, PruneMetrics, PruneSnapshot, MIN_PRUNE_INTERVAL};
