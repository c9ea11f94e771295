//! Bounded in-memory tier with recency/frequency eviction.
//!
//! # Eviction
//!
//! When a *new* key is inserted at capacity, exactly one entry is evicted:
//! the one with the lowest score
//!
//! ```text
//! score = ln(1 + hit_count) / max(seconds_since_last_access, ε)
//! ```
//!
//! so a popular entry keeps its protection only while it keeps being read.
//! Ties go to the entry with the oldest `last_accessed_at`.
//!
//! Shrinking capacity with [`FastTier::set_max_size`] is a bulk operation
//! and simply drops the least recently accessed entries.
//!
//! # Thread Safety
//!
//! The map sits behind one mutex. Every operation, including the hit-count
//! update performed by `get`, is a single critical section, so a reader can
//! never observe a half-written entry.
//!
//! Bulk removals (`clear`, `delete_by_pattern`) advance a generation
//! counter inside the same critical section. A caller that read the
//! generation before a slow lookup can insert with
//! [`FastTier::set_if_generation`] and the insert is refused if a bulk
//! removal ran in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canopy_core::{duration_to_ms, CacheEntry, Clock, EpochMillis};
use regex::Regex;
use tracing::debug;

/// Lower bound on the staleness denominator, in seconds.
const MIN_AGE_SECS: f64 = 0.001;

struct FastTierInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    max_size: usize,
    generation: u64,
}

/// Fast in-process cache tier.
pub struct FastTier<V> {
    inner: Mutex<FastTierInner<V>>,
    clock: Arc<dyn Clock>,
    evictions: AtomicU64,
}

impl<V: Clone> FastTier<V> {
    /// Create a tier holding at most `max_size` entries (clamped to >= 1).
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(FastTierInner {
                entries: HashMap::new(),
                max_size: max_size.max(1),
                generation: 0,
            }),
            clock,
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FastTierInner<V>> {
        // Every critical section leaves the map consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry, recording the hit.
    ///
    /// Expiry is not checked here; the orchestrator enforces it for both
    /// tiers.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count = entry.hit_count.saturating_add(1);
                entry.last_accessed_at = now;
                debug!(key = %key, hit_count = entry.hit_count, "Fast tier hit");
                Some(entry.clone())
            }
            None => {
                debug!(key = %key, "Fast tier miss");
                None
            }
        }
    }

    /// Look up an entry without touching its statistics.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.lock().entries.get(key).cloned()
    }

    /// Insert or overwrite an entry.
    pub fn set(&self, key: &str, payload: V, ttl: Duration) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.insert_locked(&mut inner, key, payload, ttl, now);
    }

    /// Insert only if no bulk removal has run since `generation` was read.
    /// Returns whether the entry was written.
    pub fn set_if_generation(&self, key: &str, payload: V, ttl: Duration, generation: u64) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(key = %key, "Fast tier insert skipped, bulk removal ran");
            return false;
        }
        self.insert_locked(&mut inner, key, payload, ttl, now);
        true
    }

    /// Current bulk-removal generation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn insert_locked(
        &self,
        inner: &mut FastTierInner<V>,
        key: &str,
        payload: V,
        ttl: Duration,
        now: EpochMillis,
    ) {
        let entry = CacheEntry::new(key, payload, now, duration_to_ms(ttl));
        if !inner.entries.contains_key(key) && inner.entries.len() >= inner.max_size {
            if let Some(victim) = select_victim(&inner.entries, now) {
                inner.entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "Evicted fast tier entry");
            }
        }

        debug!(key = %key, expires_at = entry.expires_at, "Fast tier set");
        inner.entries.insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.lock().entries.remove(key).is_some();
        debug!(key = %key, removed, "Fast tier delete");
        removed
    }

    /// Remove `key` only if its current entry has expired.
    pub fn delete_if_expired(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let expired = inner
            .entries
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            inner.entries.remove(key);
        }
        expired
    }

    /// Remove everything, returning how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.generation += 1;
        debug!(count, "Fast tier cleared");
        count
    }

    /// Remove every entry whose key matches `pattern`.
    pub fn delete_by_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !pattern.is_match(key));
        inner.generation += 1;
        let count = before - inner.entries.len();
        debug!(pattern = %pattern, count, "Fast tier pattern delete");
        count
    }

    /// Remove every entry with `expires_at <= now`.
    pub fn delete_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let count = before - inner.entries.len();
        debug!(count, "Fast tier expired entries removed");
        count
    }

    /// Change capacity, dropping the least recently accessed entries if the
    /// tier is now over the limit.
    pub fn set_max_size(&self, max_size: usize) {
        let max_size = max_size.max(1);
        let mut inner = self.lock();
        inner.max_size = max_size;
        debug!(max_size, "Fast tier max size updated");

        if inner.entries.len() <= max_size {
            return;
        }

        let excess = inner.entries.len() - max_size;
        let mut by_access: Vec<(EpochMillis, String)> = inner
            .entries
            .values()
            .map(|e| (e.last_accessed_at, e.key.clone()))
            .collect();
        by_access.sort();

        for (_, key) in by_access.into_iter().take(excess) {
            inner.entries.remove(&key);
        }
        self.evictions.fetch_add(excess as u64, Ordering::Relaxed);
        debug!(removed = excess, "Fast tier pruned to capacity");
    }

    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Entries removed for capacity since construction.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Desirability of keeping `entry`; lower scores are evicted first.
pub fn eviction_score<V>(entry: &CacheEntry<V>, now: EpochMillis) -> f64 {
    let age_secs = (now - entry.last_accessed_at).max(0) as f64 / 1000.0;
    let popularity = (entry.hit_count as f64).ln_1p();
    popularity / age_secs.max(MIN_AGE_SECS)
}

fn select_victim<V>(entries: &HashMap<String, CacheEntry<V>>, now: EpochMillis) -> Option<String> {
    entries
        .values()
        .map(|e| (eviction_score(e, now), e.last_accessed_at, &e.key))
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(b.2))
        })
        .map(|(_, _, key)| key.clone())
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use canopy_core::ManualClock;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The tier never holds more than max_size entries, whatever the
        /// interleaving of sets and gets.
        #[test]
        fn prop_capacity_bound(
            max_size in 1usize..8,
            ops in prop::collection::vec((0u8..16, any::<bool>(), 0u64..2_000), 1..64)
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let tier: FastTier<u8> = FastTier::new(max_size, clock.clone() as Arc<dyn Clock>);

            for (key, is_read, step_ms) in ops {
                clock.advance(Duration::from_millis(step_ms));
                let key = format!("k{key}");
                if is_read {
                    let _ = tier.get(&key);
                } else {
                    tier.set(&key, 0, Duration::from_secs(60));
                }
                prop_assert!(tier.len() <= max_size);
            }
        }
    }
}
