//! Point and batched entity reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;

use cachegate_core::cache::{
    deserialize_entity, entity_key, epoch_key, int_arg, serialize_entity, CacheScript,
    CoordinationStore, ScriptReply,
};
use cachegate_core::entity::{Entity, Key};
use cachegate_core::storage::{BackingStore, KeyedEntityStream, Result};

use crate::config::CacheSettings;
use crate::telemetry::{self, CacheStats, ReadPath};

use super::{read_epoch, CachedStore};

impl<B, C> CachedStore<B, C>
where
    B: BackingStore + 'static,
    C: CoordinationStore + 'static,
{
    pub(super) async fn load_cached(&self, namespace: &str, key: &Key) -> Result<Option<Entity>> {
        key.ensure_namespace(namespace)?;
        let cache_key = entity_key(key)?;
        let kind = key.kind();

        let started_at = Instant::now();
        let cached = self.coordination.get(&cache_key).await;
        telemetry::record_cache_elapsed(started_at);

        match cached {
            Ok(Some(bytes)) => match deserialize_entity(&bytes) {
                Ok(entity) => {
                    tracing::trace!(%cache_key, "Cache hit for entity");
                    self.stats.record_hits(kind, ReadPath::Entity, 1);
                    return Ok(Some(entity));
                }
                Err(err) => {
                    // Treat as a miss; the fill below overwrites it.
                    tracing::warn!(%cache_key, error = %err, "Cached entity deserialization failed");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    %cache_key,
                    error = %err,
                    "Coordination store unavailable, reading entity from backing store"
                );
                self.stats.record_misses(kind, ReadPath::Entity, 1);
                return self.timed_load(namespace, key).await;
            }
        }

        tracing::trace!(%cache_key, "Cache miss for entity");
        self.stats.record_misses(kind, ReadPath::Entity, 1);

        // The epoch must be read before the backing store, otherwise a write
        // landing in between would go unnoticed by the fill.
        let epoch = match read_epoch(self.coordination.as_ref(), kind).await {
            Ok(epoch) => Some(epoch),
            Err(err) => {
                tracing::warn!(kind, error = %err, "Could not read epoch, entity will not be cached");
                None
            }
        };

        let entity = self.timed_load(namespace, key).await?;

        if let (Some(entity), Some(epoch)) = (&entity, epoch) {
            fill_entity(
                self.coordination.as_ref(),
                &self.settings,
                &self.stats,
                &cache_key,
                entity,
                epoch,
            )
            .await;
        }

        Ok(entity)
    }

    pub(super) async fn batch_load_cached(
        &self,
        namespace: &str,
        keys: &[Key],
    ) -> Result<KeyedEntityStream> {
        let mut cache_keys = Vec::with_capacity(keys.len());
        for key in keys {
            key.ensure_namespace(namespace)?;
            cache_keys.push(entity_key(key)?);
        }

        let started_at = Instant::now();
        let cached = self.coordination.get_many(&cache_keys).await;
        telemetry::record_cache_elapsed(started_at);

        let cached = match cached {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(
                    count = keys.len(),
                    error = %err,
                    "Coordination store unavailable, batch loading from backing store"
                );
                for key in keys {
                    self.stats.record_misses(key.kind(), ReadPath::Entity, 1);
                }
                return self.backing.batch_load(namespace, keys, None).await;
            }
        };

        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for ((key, cache_key), bytes) in keys.iter().zip(cache_keys).zip(cached) {
            match bytes.map(|bytes| deserialize_entity(&bytes)) {
                Some(Ok(entity)) => {
                    self.stats.record_hits(key.kind(), ReadPath::Entity, 1);
                    hits.push((key.clone(), Some(entity)));
                }
                Some(Err(err)) => {
                    tracing::warn!(%cache_key, error = %err, "Cached entity deserialization failed");
                    misses.push((key.clone(), cache_key));
                }
                None => misses.push((key.clone(), cache_key)),
            }
        }
        for (key, _) in &misses {
            self.stats.record_misses(key.kind(), ReadPath::Entity, 1);
        }
        tracing::trace!(hits = hits.len(), misses = misses.len(), "Batch load partitioned");

        if misses.is_empty() {
            return Ok(futures_util::stream::iter([Ok(hits)]).boxed());
        }

        // Epochs first, for the same reason as in `load_cached`.
        let mut epochs: HashMap<String, Option<i64>> = HashMap::new();
        for (key, _) in &misses {
            if epochs.contains_key(key.kind()) {
                continue;
            }
            let epoch = match read_epoch(self.coordination.as_ref(), key.kind()).await {
                Ok(epoch) => Some(epoch),
                Err(err) => {
                    tracing::warn!(kind = key.kind(), error = %err, "Could not read epoch");
                    None
                }
            };
            epochs.insert(key.kind().to_string(), epoch);
        }

        let miss_keys: Vec<Key> = misses.iter().map(|(key, _)| key.clone()).collect();
        let started_at = Instant::now();
        let mut loaded = self.backing.batch_load(namespace, &miss_keys, None).await?;
        telemetry::record_backing_elapsed(started_at);

        let cache_keys: HashMap<Key, String> = misses.into_iter().collect();
        let coordination = self.coordination.clone();
        let settings = self.settings.clone();
        let stats = self.stats.clone();

        let stream = async_stream::stream! {
            if !hits.is_empty() {
                yield Ok(hits);
            }

            while let Some(batch) = loaded.next().await {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };

                for (key, entity) in &batch {
                    let (Some(entity), Some(cache_key)) = (entity, cache_keys.get(key)) else {
                        continue;
                    };
                    if let Some(Some(epoch)) = epochs.get(key.kind()) {
                        fill_entity(
                            coordination.as_ref(),
                            &settings,
                            &stats,
                            cache_key,
                            entity,
                            *epoch,
                        )
                        .await;
                    }
                }

                yield Ok(batch);
            }
        };

        Ok(stream.boxed())
    }

    async fn timed_load(&self, namespace: &str, key: &Key) -> Result<Option<Entity>> {
        let started_at = Instant::now();
        let entity = self.backing.load(namespace, key, None).await;
        telemetry::record_backing_elapsed(started_at);
        entity
    }
}

/// Writes `entity` under `cache_key` unless the kind's epoch moved past
/// `epoch`. Failures are logged, never returned.
async fn fill_entity<C>(
    coordination: &C,
    settings: &Arc<CacheSettings>,
    stats: &Arc<CacheStats>,
    cache_key: &str,
    entity: &Entity,
    epoch: i64,
) where
    C: CoordinationStore + ?Sized,
{
    let payload = match serialize_entity(entity) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(%cache_key, error = %err, "Failed to serialize entity for caching");
            return;
        }
    };

    let keys = [epoch_key(entity.kind()), cache_key.to_string()];
    let args = [
        int_arg(epoch),
        payload,
        int_arg(settings.entity_ttl_seconds as i64),
    ];

    let started_at = Instant::now();
    let reply = coordination
        .eval(CacheScript::TryFillEntity, &keys, &args)
        .await;
    telemetry::record_cache_elapsed(started_at);

    match reply {
        Ok(ScriptReply::Written) => {
            stats.record_writes(entity.kind(), 1);
            tracing::trace!(%cache_key, "Cached entity");
        }
        Ok(ScriptReply::Invalidated) => {
            tracing::debug!(%cache_key, epoch, "Entity changed during load, not caching");
        }
        Ok(reply) => {
            tracing::warn!(%cache_key, reply = reply.as_str(), "Unexpected entity fill reply");
        }
        Err(err) => {
            tracing::warn!(%cache_key, error = %err, "Failed to cache entity");
        }
    }
}
