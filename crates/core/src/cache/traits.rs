use std::time::Duration;

use async_trait::async_trait;

use super::{CacheScript, Result, ScriptReply};

/// Shared key-value store used for cache coordination.
///
/// Values are opaque bytes. Counters are stored as decimal strings so that
/// `get` on a counter key returns its textual value. Every operation may be
/// issued concurrently from any number of processes.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Gets a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Gets many values in one round trip, in key order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Sets a value with an optional TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Deletes keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Increments a counter, creating it at zero first.
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn decr(&self, key: &str) -> Result<i64>;

    /// Sets a key's TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Clears a key's TTL.
    async fn persist(&self, key: &str) -> Result<bool>;

    /// Remaining TTL, `None` when the key is missing or has no TTL.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Adds members to a set, returning how many were new.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Appends to a list, returning its new length.
    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64>;

    /// Inclusive range over a list. Negative indices count from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    /// Runs one of the atomic coordination scripts.
    ///
    /// # Errors
    ///
    /// Fails with `CacheError::UnexpectedReply` when the script answers with
    /// a code outside [`ScriptReply`].
    async fn eval(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptReply>;
}
