//! Logging setup, metric names and in-process cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use tracing_subscriber::{fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const METRIC_CACHE_HIT_TOTAL: &str = "cachegate_cache_hit_total";
pub const METRIC_CACHE_MISS_TOTAL: &str = "cachegate_cache_miss_total";
pub const METRIC_CACHE_WRITE_TOTAL: &str = "cachegate_cache_write_total";
pub const METRIC_QUERIES_FLUSHED_TOTAL: &str = "cachegate_queries_flushed_total";
pub const METRIC_CACHE_ELAPSED_MS: &str = "cachegate_cache_elapsed_ms";
pub const METRIC_BACKING_STORE_ELAPSED_MS: &str = "cachegate_backing_store_elapsed_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global tracing subscriber and describe metrics.
///
/// `RUST_LOG` overrides the default `cachegate=debug` filter.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    describe_metrics();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cachegate=debug,cachegate_core=debug".into());

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

/// Registers metric descriptions with the installed recorder, once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Entities served from the coordination store."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Entities that had to be read from the backing store."
        );
        describe_counter!(
            METRIC_CACHE_WRITE_TOTAL,
            Unit::Count,
            "Entity payloads written into the coordination store."
        );
        describe_counter!(
            METRIC_QUERIES_FLUSHED_TOTAL,
            Unit::Count,
            "Cached queries purged or flagged by invalidation."
        );
        describe_histogram!(
            METRIC_CACHE_ELAPSED_MS,
            Unit::Milliseconds,
            "Time spent talking to the coordination store."
        );
        describe_histogram!(
            METRIC_BACKING_STORE_ELAPSED_MS,
            Unit::Milliseconds,
            "Time spent waiting on the backing store."
        );
    });
}

/// Which read surface produced a hit or miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPath {
    Entity,
    Query,
}

impl ReadPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPath::Entity => "entity",
            ReadPath::Query => "query",
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub queries_flushed: u64,
}

/// Counters mirrored into the `metrics` facade.
///
/// The atomics let callers read totals without installing a recorder.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    queries_flushed: AtomicU64,
}

impl CacheStats {
    pub fn record_hits(&self, kind: &str, path: ReadPath, count: u64) {
        if count == 0 {
            return;
        }
        self.hits.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_CACHE_HIT_TOTAL, "kind" => kind.to_string(), "path" => path.as_str())
            .increment(count);
    }

    pub fn record_misses(&self, kind: &str, path: ReadPath, count: u64) {
        if count == 0 {
            return;
        }
        self.misses.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISS_TOTAL, "kind" => kind.to_string(), "path" => path.as_str())
            .increment(count);
    }

    pub fn record_writes(&self, kind: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.writes.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_CACHE_WRITE_TOTAL, "kind" => kind.to_string()).increment(count);
    }

    pub fn record_flushed(&self, kind: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.queries_flushed.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_QUERIES_FLUSHED_TOTAL, "kind" => kind.to_string()).increment(count);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            queries_flushed: self.queries_flushed.load(Ordering::Relaxed),
        }
    }
}

pub fn record_cache_elapsed(started_at: Instant) {
    histogram!(METRIC_CACHE_ELAPSED_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
}

pub fn record_backing_elapsed(started_at: Instant) {
    histogram!(METRIC_BACKING_STORE_ELAPSED_MS)
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = CacheStats::default();

        stats.record_hits("Widget", ReadPath::Entity, 2);
        stats.record_misses("Widget", ReadPath::Query, 3);
        stats.record_writes("Widget", 3);
        stats.record_flushed("Widget", 1);
        stats.record_hits("Widget", ReadPath::Query, 0);

        assert_eq!(
            stats.snapshot(),
            CacheStatsSnapshot {
                hits: 2,
                misses: 3,
                writes: 3,
                queries_flushed: 1,
            }
        );
    }

    #[test]
    fn test_describe_metrics_is_idempotent() {
        describe_metrics();
        describe_metrics();
    }
}
