//! Request-equivalence key derivation.
//!
//! A key is the hex SHA-256 digest of the payload's canonical JSON form,
//! optionally prefixed with `owner:{owner_id}:` so owner-scoped deletes can
//! find every key belonging to one requester by substring match.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

/// SHA-256 digest of a canonical payload.
pub type KeyDigest = [u8; 32];

const OWNER_TAG: &str = "owner";

/// Longest accepted owner id, in bytes. Keeps owner-scoped keys well under
/// LMDB's 511-byte key limit.
pub const MAX_OWNER_ID_BYTES: usize = 256;

/// Derive the cache key for a request payload.
///
/// Two payloads that are equal after sorting object keys derive the same key.
pub fn derive_key<P>(payload: &P, owner_id: Option<&str>) -> CacheResult<String>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(payload)
        .map_err(|e| CacheError::serialization("<derive_key>", e))?;
    let digest = hex::encode(compute_digest(canonical_json(&value).as_bytes()));

    match owner_id {
        Some(owner) => Ok(format!("{}{}", owner_prefix(owner)?, digest)),
        None => Ok(digest),
    }
}

/// The substring every key for `owner_id` starts with.
pub fn owner_prefix(owner_id: &str) -> CacheResult<String> {
    validate_owner_id(owner_id)?;
    Ok(format!("{OWNER_TAG}:{owner_id}:"))
}

/// Owner ids are embedded verbatim; a `:` would let one owner's prefix
/// match another owner's keys.
fn validate_owner_id(owner_id: &str) -> CacheResult<()> {
    if owner_id.is_empty() {
        return Err(CacheError::invalid_argument("owner_id", "must not be empty"));
    }
    if owner_id.len() > MAX_OWNER_ID_BYTES {
        return Err(CacheError::invalid_argument(
            "owner_id",
            format!("must be at most {MAX_OWNER_ID_BYTES} bytes (got {})", owner_id.len()),
        ));
    }
    if owner_id.contains(':') {
        return Err(CacheError::invalid_argument(
            "owner_id",
            format!("must not contain ':' (got {owner_id:?})"),
        ));
    }
    Ok(())
}

/// Compute SHA-256 of bytes.
pub fn compute_digest(content: &[u8]) -> KeyDigest {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a plain string cannot fail.
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
