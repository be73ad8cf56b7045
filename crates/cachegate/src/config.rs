use std::{env, time::Duration};

/// Cache configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// TTL of `ENTITY:{key}` in seconds (default: 3600)
    pub entity_ttl_seconds: u64,
    /// TTL of `QCACHE`/`QREFCOUNT`/`QDATA` once no reader holds them (default: 300)
    pub query_ttl_seconds: u64,
    /// TTL of `CACHEDIN` and `INDEX*` sets (default: 3600)
    pub index_ttl_seconds: u64,
    /// Expiry of `QWRITER` and of a fill's partial `QDATA` (default: 60)
    pub writer_lease_seconds: u64,
    /// How long an active reader pins `QREFCOUNT`/`QDATA` (default: 900)
    pub reader_lease_seconds: u64,
    /// Number of entities read per `LRANGE` when replaying `QDATA` (default: 100)
    pub replay_window: usize,
    /// Batches buffered between a filler and its consumer (default: 16)
    pub fill_buffer: usize,
    /// Maximum keys per `DEL` during invalidation (default: 64)
    pub invalidation_chunk: usize,
    /// Redis connection URL (default: "redis://localhost:6379")
    /// Note: Only used when the `redis` feature is enabled.
    pub redis_url: String,
}

impl CacheSettings {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CACHE_ENTITY_TTL_SECONDS` (default: 3600)
    /// - `CACHE_QUERY_TTL_SECONDS` (default: 300)
    /// - `CACHE_INDEX_TTL_SECONDS` (default: 3600)
    /// - `CACHE_WRITER_LEASE_SECONDS` (default: 60)
    /// - `CACHE_READER_LEASE_SECONDS` (default: 900)
    /// - `CACHE_REPLAY_WINDOW` (default: 100)
    /// - `CACHE_FILL_BUFFER` (default: 16)
    /// - `CACHE_INVALIDATION_CHUNK` (default: 64)
    /// - `REDIS_URL` (default: "redis://localhost:6379")
    ///
    /// Unparseable and zero values fall back to the default; Redis rejects
    /// a zero `EX`/`EXPIRE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let seconds = |name: &str, default: u64| -> u64 {
            lookup(name)
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let size = |name: &str, default: usize| -> usize {
            lookup(name)
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        Self {
            entity_ttl_seconds: seconds("CACHE_ENTITY_TTL_SECONDS", 3600),
            query_ttl_seconds: seconds("CACHE_QUERY_TTL_SECONDS", 300),
            index_ttl_seconds: seconds("CACHE_INDEX_TTL_SECONDS", 3600),
            writer_lease_seconds: seconds("CACHE_WRITER_LEASE_SECONDS", 60),
            reader_lease_seconds: seconds("CACHE_READER_LEASE_SECONDS", 900),
            replay_window: size("CACHE_REPLAY_WINDOW", 100),
            fill_buffer: size("CACHE_FILL_BUFFER", 16),
            invalidation_chunk: size("CACHE_INVALIDATION_CHUNK", 64),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
        }
    }

    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_seconds)
    }

    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_seconds)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_seconds)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_values() {
        let settings = CacheSettings::default();

        assert_eq!(settings.entity_ttl_seconds, 3600);
        assert_eq!(settings.query_ttl_seconds, 300);
        assert_eq!(settings.index_ttl_seconds, 3600);
        assert_eq!(settings.writer_lease_seconds, 60);
        assert_eq!(settings.reader_lease_seconds, 900);
        assert_eq!(settings.replay_window, 100);
        assert_eq!(settings.fill_buffer, 16);
        assert_eq!(settings.invalidation_chunk, 64);
        assert_eq!(settings.redis_url, "redis://localhost:6379");
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let vars = HashMap::from([
            ("CACHE_QUERY_TTL_SECONDS", "30"),
            ("CACHE_REPLAY_WINDOW", "0"),
            ("CACHE_FILL_BUFFER", "not-a-number"),
            ("REDIS_URL", "redis://cache:6379/2"),
        ]);

        let settings = CacheSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.query_ttl_seconds, 30);
        assert_eq!(settings.replay_window, 100);
        assert_eq!(settings.fill_buffer, 16);
        assert_eq!(settings.redis_url, "redis://cache:6379/2");
    }

    #[test]
    fn test_zero_durations_fall_back_to_defaults() {
        let vars = HashMap::from([
            ("CACHE_ENTITY_TTL_SECONDS", "0"),
            ("CACHE_QUERY_TTL_SECONDS", "0"),
            ("CACHE_INDEX_TTL_SECONDS", "0"),
            ("CACHE_WRITER_LEASE_SECONDS", "0"),
            ("CACHE_READER_LEASE_SECONDS", "0"),
        ]);

        let settings = CacheSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings, CacheSettings::default());
    }

    #[test]
    fn test_ttl_conversion() {
        let settings = CacheSettings {
            query_ttl_seconds: 600,
            ..CacheSettings::default()
        };

        assert_eq!(settings.query_ttl(), Duration::from_secs(600));
        assert_eq!(settings.entity_ttl(), Duration::from_secs(3600));
    }
}
