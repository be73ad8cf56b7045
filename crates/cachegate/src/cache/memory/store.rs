//! In-memory coordination store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use cachegate_core::cache::{CacheScript, CoordinationStore, Result, ScriptReply};

use super::keyspace::Keyspace;
use super::scripts;

/// In-memory coordination store for single-process deployments and tests.
///
/// Thread-safe store using `Arc<RwLock<Keyspace>>`. TTLs expire lazily:
/// an expired key is dropped the next time it is touched, and writes
/// periodically sweep the rest. [`MemoryCoordinationStore::spawn_sweeper`]
/// adds a timed sweep for stores that go quiet. Live keys are never evicted
/// for space, since dropping an `EPOCH` counter or a pinned `QDATA` list
/// would break the protocol.
///
/// Cloning shares the keyspace, so every clone observes the same state,
/// like several connections to one Redis server.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinationStore {
    keyspace: Arc<RwLock<Keyspace>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        self.keyspace.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every expired key now, returning how many went.
    pub async fn purge_expired(&self) -> usize {
        self.keyspace.write().await.purge_expired()
    }

    /// Keys held in memory, expired ones not yet reclaimed included.
    pub async fn slot_count(&self) -> usize {
        self.keyspace.read().await.slot_count()
    }

    /// Purges expired keys every `period` until the store is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let keyspace = Arc::downgrade(&self.keyspace);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(keyspace) = keyspace.upgrade() else {
                    break;
                };
                let purged = keyspace.write().await.purge_expired();
                if purged > 0 {
                    tracing::trace!(purged, "Swept expired coordination keys");
                }
            }
        })
    }

    /// Live keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keyspace.read().await.keys_with_prefix(prefix)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.keyspace.write().await.get(key)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut space = self.keyspace.write().await;
        keys.iter().map(|key| space.get(key)).collect()
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.keyspace.write().await.set(key, value.to_vec(), ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(self.keyspace.write().await.delete(keys))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.write().await.exists(key))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.keyspace.write().await.incr_by(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.keyspace.write().await.incr_by(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.keyspace.write().await.expire(key, ttl))
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.write().await.persist(key))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.keyspace.read().await.ttl(key))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.keyspace.write().await.sadd(key, members)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.keyspace.write().await.srem(key, members)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.keyspace.read().await.smembers(key)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        self.keyspace.write().await.rpush(key, values)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.keyspace.read().await.lrange(key, start, stop)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.keyspace.read().await.llen(key)
    }

    async fn eval(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptReply> {
        let mut space = self.keyspace.write().await;
        scripts::run(&mut space, script, keys, args)
    }
}
