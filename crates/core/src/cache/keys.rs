//! Coordination store key names.
//!
//! The naming scheme is shared with operational tooling that inspects the
//! coordination store directly, so these formats must not change.

use crate::entity::{Key, Result};

use super::Fingerprint;

/// Value stored in `QWRITER:{H}` once a write has invalidated the fill.
pub const WRITER_INVALIDATED: &str = "invalidated";

/// Returns the cache key holding a serialized entity.
///
/// # Errors
///
/// Fails for malformed or incomplete keys.
pub fn entity_key(key: &Key) -> Result<String> {
    Ok(format!("ENTITY:{}", key.encode()?))
}

/// Returns the per-kind write counter key.
pub fn epoch_key(kind: &str) -> String {
    format!("EPOCH:{}", kind)
}

/// Returns the "result set for H is valid" marker key.
pub fn query_cache_key(fingerprint: &Fingerprint) -> String {
    format!("QCACHE:{}", fingerprint)
}

/// Returns the active reader count key.
pub fn query_refcount_key(fingerprint: &Fingerprint) -> String {
    format!("QREFCOUNT:{}", fingerprint)
}

/// Returns the exclusive filler marker key.
pub fn query_writer_key(fingerprint: &Fingerprint) -> String {
    format!("QWRITER:{}", fingerprint)
}

/// Returns the ordered result list key.
pub fn query_data_key(fingerprint: &Fingerprint) -> String {
    format!("QDATA:{}", fingerprint)
}

/// Returns the set of fingerprints that scanned a whole kind.
pub fn index_all_key(namespace: &str, kind: &str) -> String {
    format!("INDEXALL:{}:{}", namespace, kind)
}

/// Returns the set of fingerprints whose filter or sort touched `field`.
pub fn index_column_key(namespace: &str, kind: &str, field: &str) -> String {
    format!("INDEXCOL:{}:{}:{}", namespace, kind, field)
}

/// Returns the set of fingerprints whose cached results include `key`.
///
/// # Errors
///
/// Fails for malformed or incomplete keys.
pub fn cached_in_key(key: &Key) -> Result<String> {
    Ok(format!("CACHEDIN:{}", key.encode()?))
}

/// The four keys describing one cached query, in script order:
/// `QCACHE`, `QREFCOUNT`, `QDATA`, `QWRITER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeys {
    pub cache: String,
    pub refcount: String,
    pub data: String,
    pub writer: String,
}

impl QueryKeys {
    pub fn new(fingerprint: &Fingerprint) -> Self {
        Self {
            cache: query_cache_key(fingerprint),
            refcount: query_refcount_key(fingerprint),
            data: query_data_key(fingerprint),
            writer: query_writer_key(fingerprint),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        vec![
            self.cache.clone(),
            self.refcount.clone(),
            self.data.clone(),
            self.writer.clone(),
        ]
    }
}
