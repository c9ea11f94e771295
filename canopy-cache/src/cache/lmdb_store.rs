//! LMDB-backed `CacheStore`.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped,
//! crash-safe row table that survives restarts.
//!
//! # Layout
//!
//! One unnamed database. The key is the UTF-8 cache key and the value is the
//! JSON-encoded [`CacheRow`]. There are no secondary indexes: substring,
//! expiry and frequency queries scan the database inside one transaction.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Point reads use a read transaction;
//! every mutation, including scan-then-delete, runs in a single write
//! transaction, so a bulk delete never interleaves with another writer.
//!
//! LMDB rejects keys longer than [`MAX_KEY_BYTES`]. Such keys can never be
//! stored: `upsert` refuses them and point lookups treat them as absent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canopy_core::{CacheError, CacheResult, CacheRow, EpochMillis, StorageError};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use super::store::{sort_by_frequency, sort_by_recency, CacheStore};

/// LMDB's default maximum key size.
pub const MAX_KEY_BYTES: usize = 511;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Failed to encode row {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Failed to decode row {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::EnvOpen { .. } | LmdbCacheError::DbOpen(_) | LmdbCacheError::Io(_) => {
                CacheError::store_unavailable(e.to_string())
            }
            LmdbCacheError::Transaction(reason) => {
                CacheError::Storage(StorageError::TransactionFailed { reason })
            }
            LmdbCacheError::Serialization { key, reason } => {
                CacheError::Serialization { key, reason }
            }
            LmdbCacheError::Deserialization { key, reason } => {
                CacheError::Storage(StorageError::CorruptRecord { key, reason })
            }
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

fn storable(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_BYTES
}

struct LmdbHandle {
    env: Env,
    db: Database<Str, Bytes>,
}

/// Durable store over an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use canopy_cache::cache::{CacheStore, LmdbCacheStore};
///
/// let store = LmdbCacheStore::new("/var/lib/canopy", 64);
/// store.initialize().await?;
/// let rows = store.most_frequently_used(10).await?;
/// ```
pub struct LmdbCacheStore {
    path: PathBuf,
    map_size_mb: usize,
    handle: OnceCell<LmdbHandle>,
}

impl LmdbCacheStore {
    /// Create an unopened store. Nothing touches disk until
    /// [`CacheStore::initialize`].
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            map_size_mb,
            handle: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.get().is_some()
    }

    fn open(&self) -> Result<LmdbHandle, LmdbCacheError> {
        std::fs::create_dir_all(&self.path)?;

        // SAFETY: the environment is opened once per store and the
        // directory is not opened twice within this process by this type.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(&self.path)
        }
        .map_err(|e| LmdbCacheError::EnvOpen {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(LmdbHandle { env, db })
    }

    fn handle(&self) -> CacheResult<&LmdbHandle> {
        self.handle.get().ok_or_else(|| {
            CacheError::store_unavailable(format!(
                "LMDB store at {} not initialized",
                self.path.display()
            ))
        })
    }
}

fn encode_row(row: &CacheRow) -> Result<Vec<u8>, LmdbCacheError> {
    serde_json::to_vec(row).map_err(|e| LmdbCacheError::Serialization {
        key: row.key.clone(),
        reason: e.to_string(),
    })
}

fn decode_row(key: &str, bytes: &[u8]) -> Result<CacheRow, LmdbCacheError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbCacheError::Deserialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode every row in the database, skipping (and logging) corrupt ones.
fn scan_rows(handle: &LmdbHandle, txn: &RoTxn) -> Result<Vec<CacheRow>, LmdbCacheError> {
    let mut rows = Vec::new();
    for result in handle.db.iter(txn).map_err(txn_err)? {
        let (key, bytes) = result.map_err(txn_err)?;
        match decode_row(key, bytes) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(key = %key, error = %e, "Skipping corrupt cache row"),
        }
    }
    Ok(rows)
}

/// Collect keys satisfying `pred`. Corrupt values are passed as `None`.
fn scan_keys<F>(handle: &LmdbHandle, txn: &RoTxn, mut pred: F) -> Result<Vec<String>, LmdbCacheError>
where
    F: FnMut(&str, Option<&CacheRow>) -> bool,
{
    let mut keys = Vec::new();
    for result in handle.db.iter(txn).map_err(txn_err)? {
        let (key, bytes) = result.map_err(txn_err)?;
        let row = decode_row(key, bytes).ok();
        if pred(key, row.as_ref()) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

#[async_trait]
impl CacheStore for LmdbCacheStore {
    async fn initialize(&self) -> CacheResult<()> {
        if self.handle.get().is_some() {
            return Ok(());
        }
        self.handle.get_or_try_init(|| self.open())?;
        info!(
            path = %self.path.display(),
            map_size_mb = self.map_size_mb,
            "LMDB cache store opened"
        );
        Ok(())
    }

    async fn upsert(&self, row: CacheRow) -> CacheResult<()> {
        let handle = self.handle()?;
        if !storable(&row.key) {
            return Err(CacheError::invalid_argument(
                "key",
                format!("must be 1..={MAX_KEY_BYTES} bytes (got {})", row.key.len()),
            ));
        }
        let bytes = encode_row(&row)?;

        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;
        handle
            .db
            .put(&mut wtxn, &row.key, &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> CacheResult<Option<CacheRow>> {
        let handle = self.handle()?;
        if !storable(key) {
            return Ok(None);
        }
        let rtxn = handle.env.read_txn().map_err(txn_err)?;

        match handle.db.get(&rtxn, key).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode_row(key, bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_stats(
        &self,
        key: &str,
        hit_count: u64,
        last_accessed_at: EpochMillis,
    ) -> CacheResult<()> {
        let handle = self.handle()?;
        if !storable(key) {
            return Ok(());
        }
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;

        let existing = match handle.db.get(&wtxn, key).map_err(txn_err)? {
            Some(bytes) => decode_row(key, bytes)?,
            None => return Ok(()),
        };
        let updated = CacheRow {
            hit_count,
            last_accessed_at,
            ..existing
        };
        let bytes = encode_row(&updated)?;
        handle.db.put(&mut wtxn, key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn record_hit(&self, key: &str, accessed_at: EpochMillis) -> CacheResult<()> {
        let handle = self.handle()?;
        if !storable(key) {
            return Ok(());
        }
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;

        let mut row = match handle.db.get(&wtxn, key).map_err(txn_err)? {
            Some(bytes) => decode_row(key, bytes)?,
            None => return Ok(()),
        };
        row.hit_count = row.hit_count.saturating_add(1);
        row.last_accessed_at = accessed_at;
        let bytes = encode_row(&row)?;
        handle.db.put(&mut wtxn, key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let handle = self.handle()?;
        if !storable(key) {
            return Ok(false);
        }
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;
        let removed = handle.db.delete(&mut wtxn, key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }

    async fn delete_if_unchanged(&self, key: &str, seen: Option<&CacheRow>) -> CacheResult<bool> {
        let handle = self.handle()?;
        if !storable(key) {
            return Ok(false);
        }
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;

        let unchanged = match handle.db.get(&wtxn, key).map_err(txn_err)? {
            Some(bytes) => match (decode_row(key, bytes), seen) {
                (Ok(current), Some(seen)) => current.same_write(seen),
                (Err(_), None) => true,
                _ => false,
            },
            None => false,
        };
        if !unchanged {
            // Dropping the txn aborts it.
            return Ok(false);
        }
        handle.db.delete(&mut wtxn, key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let handle = self.handle()?;
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;

        let keys = scan_keys(handle, &wtxn, |key, _| key.contains(pattern))?;
        for key in &keys {
            handle.db.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        debug!(pattern = %pattern, count = keys.len(), "LMDB rows deleted by pattern");
        Ok(keys.len() as u64)
    }

    async fn delete_expired(&self, now: EpochMillis) -> CacheResult<u64> {
        let handle = self.handle()?;
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;

        let keys = scan_keys(handle, &wtxn, |_, row| {
            row.map(|r| r.is_expired(now)).unwrap_or(false)
        })?;
        for key in &keys {
            handle.db.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        debug!(count = keys.len(), "LMDB expired rows deleted");
        Ok(keys.len() as u64)
    }

    async fn clear(&self) -> CacheResult<()> {
        let handle = self.handle()?;
        let mut wtxn = handle.env.write_txn().map_err(txn_err)?;
        handle.db.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn most_frequently_used(&self, limit: usize) -> CacheResult<Vec<CacheRow>> {
        let handle = self.handle()?;
        let rtxn = handle.env.read_txn().map_err(txn_err)?;

        let mut rows = scan_rows(handle, &rtxn)?;
        sort_by_frequency(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let handle = self.handle()?;
        let rtxn = handle.env.read_txn().map_err(txn_err)?;
        // Keys come back in LMDB's lexicographic order.
        Ok(scan_keys(handle, &rtxn, |key, _| key.contains(pattern))?)
    }

    async fn count(&self) -> CacheResult<u64> {
        let handle = self.handle()?;
        let rtxn = handle.env.read_txn().map_err(txn_err)?;
        Ok(handle.db.len(&rtxn).map_err(txn_err)?)
    }

    async fn least_recently_used(&self, limit: usize) -> CacheResult<Vec<String>> {
        let handle = self.handle()?;
        let rtxn = handle.env.read_txn().map_err(txn_err)?;

        let mut pairs: Vec<(EpochMillis, String)> = scan_rows(handle, &rtxn)?
            .into_iter()
            .map(|row| (row.last_accessed_at, row.key))
            .collect();
        sort_by_recency(&mut pairs);
        Ok(pairs.into_iter().take(limit).map(|(_, key)| key).collect())
    }

    async fn flush(&self) -> CacheResult<()> {
        let handle = self.handle()?;
        handle.env.force_sync().map_err(txn_err)?;
        Ok(())
    }
}
