//! Two-tier response cache.
//!
//! A bounded in-memory [`FastTier`] sits in front of a [`DurableTier`] that
//! persists rows through a pluggable [`CacheStore`]. [`ResponseCache`]
//! composes the two; neither tier knows about the other.
//!
//! # Key Scoping
//!
//! Keys derived with an owner carry an `owner:{id}:` prefix, so every entry
//! belonging to one requester can be removed with a single substring delete
//! ([`ResponseCache::delete_for_owner`]).
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(ResponseCache::from_settings(&settings));
//! cache.initialize().await?;
//!
//! let key = cache.derive_key(&request, Some(&user_id))?;
//! let picks = cache
//!     .get_or_compute(&key, None, || recommend(&request))
//!     .await?;
//! ```

pub mod durable_tier;
pub mod fast_tier;
mod key_lock;
pub mod lmdb_store;
pub mod memory_store;
pub mod response_cache;
pub mod store;

pub use durable_tier::{DurableHit, DurableTier};
pub use fast_tier::{eviction_score, FastTier};
pub use lmdb_store::{LmdbCacheError, LmdbCacheStore, MAX_KEY_BYTES};
pub use memory_store::MemoryCacheStore;
pub use response_cache::{CacheStats, PruneReport, ResponseCache};
pub use store::CacheStore;
