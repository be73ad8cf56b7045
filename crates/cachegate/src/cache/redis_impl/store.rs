//! Redis coordination store.
//!
//! Primitives map one-to-one onto Redis commands; the protocol scripts run
//! server-side through `EVALSHA`, falling back to `EVAL` when the script
//! cache was flushed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use cachegate_core::cache::{CacheScript, CoordinationStore, Result, ScriptReply};

use super::error::map_redis_error;

fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis coordination store using a connection manager for pooling.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: redis::aio::ConnectionManager,
    scripts: Arc<HashMap<CacheScript, redis::Script>>,
}

impl RedisCoordinationStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        let scripts = CacheScript::ALL
            .into_iter()
            .map(|script| (script, redis::Script::new(script.source())))
            .collect();
        Ok(Self {
            conn,
            scripts: Arc::new(scripts),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_redis_error)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(duration) => conn
                .set_ex::<_, _, ()>(key, value, seconds(duration))
                .await
                .map_err(map_redis_error),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(map_redis_error),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del(keys).await.map_err(map_redis_error)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(map_redis_error)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(map_redis_error)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.decr(key, 1).await.map_err(map_redis_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.expire(key, seconds(ttl) as i64)
            .await
            .map_err(map_redis_error)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.persist(key).await.map_err(map_redis_error)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let remaining: i64 = conn.ttl(key).await.map_err(map_redis_error)?;
        // -2: missing key, -1: no TTL.
        Ok((remaining >= 0).then(|| Duration::from_secs(remaining as u64)))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.sadd(key, members).await.map_err(map_redis_error)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.srem(key, members).await.map_err(map_redis_error)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(map_redis_error)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn.clone();
        conn.rpush(key, values).await.map_err(map_redis_error)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(map_redis_error)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(map_redis_error)
    }

    async fn eval(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptReply> {
        let fallback;
        let compiled = match self.scripts.get(&script) {
            Some(compiled) => compiled,
            None => {
                fallback = redis::Script::new(script.source());
                &fallback
            }
        };

        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }

        let mut conn = self.conn.clone();
        let reply: String = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        ScriptReply::parse(&reply)
    }
}
