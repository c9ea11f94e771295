//! Durable store adapter trait.
//!
//! A `CacheStore` is a row-oriented table keyed by cache key. Each method is
//! atomic with respect to other calls on the same store: backends run it in a
//! single transaction or under a single lock acquisition.

use async_trait::async_trait;
use canopy_core::{CacheResult, CacheRow, EpochMillis};

/// Pluggable durable backend for the response cache.
///
/// Implementations must return `CacheError::StoreUnavailable` from every
/// method until [`CacheStore::initialize`] has succeeded.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open the backing storage. Calling it again is a no-op.
    async fn initialize(&self) -> CacheResult<()>;

    /// Insert the row, replacing any row with the same key.
    async fn upsert(&self, row: CacheRow) -> CacheResult<()>;

    async fn fetch(&self, key: &str) -> CacheResult<Option<CacheRow>>;

    /// Overwrite the read statistics of an existing row.
    ///
    /// A missing key is not an error; the row may have been deleted
    /// concurrently.
    async fn update_stats(
        &self,
        key: &str,
        hit_count: u64,
        last_accessed_at: EpochMillis,
    ) -> CacheResult<()>;

    /// Add one to the stored hit count and stamp the access time.
    ///
    /// The increment reads and writes the row in one step, so concurrent
    /// hits are all counted. A missing key is not an error.
    async fn record_hit(&self, key: &str, accessed_at: EpochMillis) -> CacheResult<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete `key` only while it still holds the write a reader saw.
    ///
    /// `seen` is the row returned by an earlier fetch, or `None` when that
    /// fetch reported a corrupt record. A row written since is left alone.
    async fn delete_if_unchanged(&self, key: &str, seen: Option<&CacheRow>) -> CacheResult<bool>;

    /// Delete every row whose key contains `pattern` as a substring.
    async fn delete_matching(&self, pattern: &str) -> CacheResult<u64>;

    /// Delete every row with `expires_at <= now`.
    async fn delete_expired(&self, now: EpochMillis) -> CacheResult<u64>;

    async fn clear(&self) -> CacheResult<()>;

    /// Rows ordered by hit count, highest first.
    async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>>;

    /// Keys containing `pattern` as a substring.
    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>>;

    async fn count(&self) -> CacheResult<u64>;

    /// Keys ordered by `last_accessed_at`, oldest first.
    async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>>;

    /// Force buffered writes to stable storage.
    async fn flush(&self) -> CacheResult<()>;
}

/// Order rows for [`CacheStore::most_frequently_used`].
///
/// Equal hit counts fall back to the most recent access, then the key, so
/// results are stable across backends.
pub(crate) fn sort_by_frequency(rows: &mut [CacheRow]) {
    rows.sort_by(|a, b| {
        b.hit_count
            .cmp(&a.hit_count)
            .then(b.last_accessed_at.cmp(&a.last_accessed_at))
            .then_with(|| a.key.cmp(&b.key))
    });
}

/// Order `(last_accessed_at, key)` pairs for
/// [`CacheStore::least_recently_used`].
pub(crate) fn sort_by_recency(pairs: &mut [(EpochMillis, String)]) {
    pairs.sort();
}
