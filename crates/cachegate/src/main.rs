use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::TryStreamExt;

use cachegate::cache::MemoryCoordinationStore;
use cachegate::telemetry::{self, LogFormat};
use cachegate::{CacheSettings, CachedStore, InMemoryBackingStore};
use cachegate_core::cache::{CoordinationStore, Fingerprint, QueryKeys};
use cachegate_core::entity::{Entity, Key};
use cachegate_core::query::{FilterOp, Query};
use cachegate_core::storage::BackingStore;

/// Cachegate - Read-through cache coordination that never serves stale queries
#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "LOG_FORMAT")]
    log_format: LogFormat,

    /// Coordination store URL, overrides `REDIS_URL`
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the fingerprint and coordination keys of a query
    Fingerprint {
        /// Namespace the query runs in
        #[arg(long, short, default_value = "default")]
        namespace: String,

        /// Query as JSON, e.g. '{"kind":"Widget","filters":[...]}'
        query: String,
    },

    /// Run a fill, hit and invalidation cycle against in-process stores
    Demo {
        /// Use the Redis server at REDIS_URL as coordination store
        #[cfg(feature = "redis")]
        #[arg(long)]
        redis: bool,
    },

    /// Show the coordination state of one cached query
    #[cfg(feature = "redis")]
    Inspect {
        /// Hex fingerprint, as printed by `fingerprint`
        fingerprint: String,
    },

    /// Invalidate every in-flight fill of a kind by bumping its epoch
    #[cfg(feature = "redis")]
    BumpEpoch {
        /// Entity kind
        kind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    let mut settings = CacheSettings::from_env();
    if let Some(url) = cli.redis_url {
        settings.redis_url = url;
    }

    match cli.command {
        Command::Fingerprint { namespace, query } => print_fingerprint(&namespace, &query),
        #[cfg(feature = "redis")]
        Command::Demo { redis: true } => {
            let coordination =
                cachegate::cache::RedisCoordinationStore::new(&settings.redis_url).await?;
            run_demo(Arc::new(coordination), settings).await
        }
        #[cfg(feature = "redis")]
        Command::Demo { redis: false } => {
            run_demo(Arc::new(MemoryCoordinationStore::new()), settings).await
        }
        #[cfg(not(feature = "redis"))]
        Command::Demo {} => run_demo(Arc::new(MemoryCoordinationStore::new()), settings).await,
        #[cfg(feature = "redis")]
        Command::Inspect { fingerprint } => inspect(&settings, &fingerprint).await,
        #[cfg(feature = "redis")]
        Command::BumpEpoch { kind } => bump_epoch(&settings, &kind).await,
    }
}

fn print_fingerprint(namespace: &str, raw: &str) -> Result<()> {
    let query: Query = serde_json::from_str(raw).context("query is not valid JSON")?;
    let fingerprint = Fingerprint::of(namespace, &query)?;
    let keys = QueryKeys::new(&fingerprint);

    let out = serde_json::json!({
        "fingerprint": fingerprint.as_str(),
        "keys": {
            "cache": keys.cache,
            "refcount": keys.refcount,
            "data": keys.data,
            "writer": keys.writer,
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run_demo<C>(coordination: Arc<C>, settings: CacheSettings) -> Result<()>
where
    C: CoordinationStore + 'static,
{
    let namespace = "demo";
    let backing = Arc::new(InMemoryBackingStore::new());
    let store = CachedStore::new(backing.clone(), coordination, settings);

    let key = Key::with_name(namespace, "Widget", "sprocket");
    let widget = Entity::new(key.clone()).with("color", "red").with("size", 3);
    store.upsert(namespace, &[widget], None).await?;

    let red = Query::kind("Widget").filter("color", FilterOp::Equal, "red");
    let blue = Query::kind("Widget").filter("color", FilterOp::Equal, "blue");

    let filled = run_query(&store, namespace, &red).await?;
    let replayed = run_query(&store, namespace, &red).await?;
    tracing::info!(filled = filled.len(), replayed = replayed.len(), "Red widgets");

    let mut repainted = store
        .load(namespace, &key, None)
        .await?
        .context("widget vanished")?;
    repainted.set("color", "blue");
    store.update(namespace, &[repainted], None).await?;

    let red_after = run_query(&store, namespace, &red).await?;
    let blue_after = run_query(&store, namespace, &blue).await?;
    tracing::info!(
        red = red_after.len(),
        blue = blue_after.len(),
        "After repainting the widget"
    );

    let stats = store.stats();
    let out = serde_json::json!({
        "backing_store_queries": backing.query_calls(),
        "hits": stats.hits,
        "misses": stats.misses,
        "writes": stats.writes,
        "queries_flushed": stats.queries_flushed,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run_query<C>(
    store: &CachedStore<InMemoryBackingStore, C>,
    namespace: &str,
    query: &Query,
) -> Result<Vec<Entity>>
where
    C: CoordinationStore + 'static,
{
    let batches: Vec<Vec<Entity>> = store.query(namespace, query, None).await?.try_collect().await?;
    Ok(batches.into_iter().flatten().collect())
}

#[cfg(feature = "redis")]
async fn inspect(settings: &CacheSettings, fingerprint: &str) -> Result<()> {
    let store = cachegate::cache::RedisCoordinationStore::new(&settings.redis_url).await?;
    let keys = QueryKeys::new(&Fingerprint::from_hex(fingerprint));

    let text = |bytes: Option<Vec<u8>>| bytes.map(|b| String::from_utf8_lossy(&b).into_owned());
    let ttl = |ttl: Option<std::time::Duration>| ttl.map(|d| d.as_secs());

    let out = serde_json::json!({
        "cache": {
            "present": store.exists(&keys.cache).await?,
            "ttl_seconds": ttl(store.ttl(&keys.cache).await?),
        },
        "refcount": {
            "value": text(store.get(&keys.refcount).await?),
            "ttl_seconds": ttl(store.ttl(&keys.refcount).await?),
        },
        "data": {
            "length": store.llen(&keys.data).await?,
            "ttl_seconds": ttl(store.ttl(&keys.data).await?),
        },
        "writer": {
            "value": text(store.get(&keys.writer).await?),
            "ttl_seconds": ttl(store.ttl(&keys.writer).await?),
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(feature = "redis")]
async fn bump_epoch(settings: &CacheSettings, kind: &str) -> Result<()> {
    let store = cachegate::cache::RedisCoordinationStore::new(&settings.redis_url).await?;
    let epoch = store.incr(&cachegate_core::cache::epoch_key(kind)).await?;
    tracing::info!(kind, epoch, "Bumped epoch");
    Ok(())
}
