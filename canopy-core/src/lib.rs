//! Canopy Core - shared types for the response cache
//!
//! Error taxonomy, configuration, the clock abstraction, the entry/row data
//! model and request-key derivation. The cache tiers themselves live in
//! `canopy-cache`; this crate holds no mutable state.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;

pub use clock::{duration_to_ms, Clock, EpochMillis, ManualClock, SystemClock};
pub use config::{CacheMode, CacheSettings, StoreSettings, CONFIG_ENV_VAR};
pub use entry::{CacheEntry, CachePayload, CacheRow};
pub use error::{CacheError, CacheResult, ConfigError, StorageError};
pub use key::{canonical_json, compute_digest, derive_key, owner_prefix, KeyDigest, MAX_OWNER_ID_BYTES};
