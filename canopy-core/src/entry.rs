//! Cache entry data model shared by both tiers.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::clock::EpochMillis;

/// Marker trait for values that can be cached.
///
/// Payloads are opaque to the cache: they only need to survive a round
/// trip through JSON. Every `Serialize + DeserializeOwned` type that is
/// `Send + Sync + 'static` qualifies automatically.
pub trait CachePayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CachePayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// An entry held by the fast in-memory tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub created_at: EpochMillis,
    pub last_accessed_at: EpochMillis,
    pub ttl_ms: i64,
    /// Fixed at insertion; reads never extend it.
    pub expires_at: EpochMillis,
    pub hit_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, payload: V, now: EpochMillis, ttl_ms: i64) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: now,
            last_accessed_at: now,
            ttl_ms,
            expires_at: now.saturating_add(ttl_ms),
            hit_count: 0,
        }
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.expires_at <= now
    }

    /// Milliseconds left before expiry, zero if already expired.
    pub fn remaining_ttl_ms(&self, now: EpochMillis) -> i64 {
        (self.expires_at - now).max(0)
    }
}

/// A row in the durable tier. `data` holds the JSON-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: String,
    pub data: String,
    pub created_at: EpochMillis,
    pub expires_at: EpochMillis,
    pub ttl_ms: i64,
    pub hit_count: u64,
    pub last_accessed_at: EpochMillis,
}

impl CacheRow {
    pub fn new(key: impl Into<String>, data: String, now: EpochMillis, ttl_ms: i64) -> Self {
        Self {
            key: key.into(),
            data,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
            ttl_ms,
            hit_count: 0,
            last_accessed_at: now,
        }
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.expires_at <= now
    }

    /// True if both rows come from the same write. Read statistics are
    /// ignored.
    pub fn same_write(&self, other: &CacheRow) -> bool {
        self.key == other.key
            && self.created_at == other.created_at
            && self.expires_at == other.expires_at
            && self.data == other.data
    }
}
