//! Query reads: obtain, replay and fallback.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use cachegate_core::cache::{
    deserialize_entities, int_arg, str_arg, CacheScript, CoordinationStore, Fingerprint,
    QueryKeys, ScriptReply,
};
use cachegate_core::query::Query;
use cachegate_core::storage::{BackingStore, EntityBatchStream, RepositoryError, Result};

use crate::telemetry::{self, CacheStats, ReadPath};

use super::fill::FillJob;
use super::{is_cancelled, read_epoch, CachedStore};

impl<B, C> CachedStore<B, C>
where
    B: BackingStore + 'static,
    C: CoordinationStore + 'static,
{
    /// Runs `query` outside any transaction.
    ///
    /// Setting `cancel` to `true` stops the stream at the next batch
    /// boundary with [`RepositoryError::Cancelled`]. A fill this call
    /// started is abandoned, and a reader lease it holds is released.
    ///
    /// # Errors
    ///
    /// Fails before touching any store when the query's ancestor key is
    /// malformed or belongs to another namespace. Backing-store errors are
    /// returned unchanged; coordination-store errors never are.
    pub async fn query_with_cancel(
        &self,
        namespace: &str,
        query: &Query,
        cancel: watch::Receiver<bool>,
    ) -> Result<EntityBatchStream> {
        let fingerprint = Fingerprint::of(namespace, query)?;
        let keys = QueryKeys::new(&fingerprint);

        let epoch = match read_epoch(self.coordination.as_ref(), &query.kind).await {
            Ok(epoch) => epoch,
            Err(err) => {
                tracing::warn!(
                    %fingerprint,
                    error = %err,
                    "Coordination store unavailable, querying backing store"
                );
                return self.direct_query(namespace, query, cancel).await;
            }
        };

        let token = Uuid::new_v4().to_string();
        let args = [
            str_arg(&token),
            int_arg(self.settings.writer_lease_seconds as i64),
            int_arg(self.settings.reader_lease_seconds as i64),
        ];
        let started_at = Instant::now();
        let outcome = self
            .coordination
            .eval(CacheScript::Obtain, &keys.to_vec(), &args)
            .await;
        telemetry::record_cache_elapsed(started_at);

        match outcome {
            Ok(ScriptReply::Cache) => {
                tracing::trace!(%fingerprint, "Cache hit for query");
                Ok(self.replay(namespace, query, keys, cancel))
            }
            Ok(ScriptReply::NoCacheStore) => {
                tracing::debug!(%fingerprint, epoch, "Cache miss for query, filling");
                let job = FillJob {
                    backing: self.backing.clone(),
                    coordination: self.coordination.clone(),
                    settings: self.settings.clone(),
                    stats: self.stats.clone(),
                    namespace: namespace.to_string(),
                    query: query.clone(),
                    fingerprint,
                    epoch,
                    token,
                    cancel,
                };
                Ok(job.start())
            }
            Ok(ScriptReply::NoCacheNoStore) => {
                tracing::trace!(%fingerprint, "Query cache busy, reading backing store");
                self.direct_query(namespace, query, cancel).await
            }
            Ok(reply) => {
                tracing::warn!(%fingerprint, reply = reply.as_str(), "Unexpected obtain reply");
                self.direct_query(namespace, query, cancel).await
            }
            Err(err) => {
                tracing::warn!(
                    %fingerprint,
                    error = %err,
                    "Coordination store unavailable, querying backing store"
                );
                self.direct_query(namespace, query, cancel).await
            }
        }
    }

    async fn direct_query(
        &self,
        namespace: &str,
        query: &Query,
        cancel: watch::Receiver<bool>,
    ) -> Result<EntityBatchStream> {
        let started_at = Instant::now();
        let results = self.backing.query(namespace, query, None).await?;
        telemetry::record_backing_elapsed(started_at);

        Ok(passthrough(
            results,
            0,
            cancel,
            self.stats.clone(),
            query.kind.clone(),
        ))
    }

    /// Streams `QDATA` in windows while holding a reader lease.
    fn replay(
        &self,
        namespace: &str,
        query: &Query,
        keys: QueryKeys,
        cancel: watch::Receiver<bool>,
    ) -> EntityBatchStream {
        let coordination = self.coordination.clone();
        let backing = self.backing.clone();
        let stats = self.stats.clone();
        let window = self.settings.replay_window;
        let namespace = namespace.to_string();
        let query = query.clone();
        let mut lease = ReaderLease::new(
            coordination.clone(),
            &keys,
            self.settings.query_ttl_seconds,
        );

        let stream = async_stream::stream! {
            let mut offset = 0usize;
            loop {
                if is_cancelled(&cancel) {
                    lease.release().await;
                    yield Err(RepositoryError::Cancelled);
                    return;
                }

                let started_at = Instant::now();
                let window_end = (offset + window - 1) as i64;
                let entities = coordination
                    .lrange(&keys.data, offset as i64, window_end)
                    .await
                    .and_then(|payloads| deserialize_entities(&payloads));
                telemetry::record_cache_elapsed(started_at);

                match entities {
                    Ok(entities) if entities.is_empty() => break,
                    Ok(entities) => {
                        let count = entities.len();
                        offset += count;
                        stats.record_hits(&query.kind, ReadPath::Query, count as u64);
                        if count < window {
                            lease.release().await;
                            yield Ok(entities);
                            return;
                        }
                        yield Ok(entities);
                    }
                    Err(err) => {
                        tracing::warn!(
                            data = %keys.data,
                            offset,
                            error = %err,
                            "Query replay failed, continuing from backing store"
                        );
                        lease.release().await;

                        let results = match backing.query(&namespace, &query, None).await {
                            Ok(results) => results,
                            Err(err) => {
                                yield Err(err);
                                return;
                            }
                        };
                        let mut rest = passthrough(
                            results,
                            offset,
                            cancel.clone(),
                            stats.clone(),
                            query.kind.clone(),
                        );
                        while let Some(item) = rest.next().await {
                            yield item;
                        }
                        return;
                    }
                }
            }
            lease.release().await;
        };

        stream.boxed()
    }
}

/// Forwards backing-store batches, dropping the first `skip` entities and
/// honoring `cancel` between batches. Stops after the first error.
fn passthrough(
    mut results: EntityBatchStream,
    mut skip: usize,
    cancel: watch::Receiver<bool>,
    stats: Arc<CacheStats>,
    kind: String,
) -> EntityBatchStream {
    let stream = async_stream::stream! {
        while let Some(item) = results.next().await {
            if is_cancelled(&cancel) {
                yield Err(RepositoryError::Cancelled);
                return;
            }
            match item {
                Ok(mut batch) => {
                    if skip >= batch.len() {
                        skip -= batch.len();
                        continue;
                    }
                    let batch = batch.split_off(skip);
                    skip = 0;
                    stats.record_misses(&kind, ReadPath::Query, batch.len() as u64);
                    yield Ok(batch);
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    };

    stream.boxed()
}

/// A pin on `QREFCOUNT`/`QDATA` taken by `obtain`.
///
/// Released explicitly when replay finishes; if the stream is dropped
/// first, the release runs on a spawned task.
struct ReaderLease<C: CoordinationStore + 'static> {
    coordination: Arc<C>,
    keys: Vec<String>,
    ttl_seconds: u64,
    released: bool,
}

impl<C: CoordinationStore + 'static> ReaderLease<C> {
    fn new(coordination: Arc<C>, keys: &QueryKeys, ttl_seconds: u64) -> Self {
        Self {
            coordination,
            keys: keys.to_vec(),
            ttl_seconds,
            released: false,
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_reader(self.coordination.as_ref(), &self.keys, self.ttl_seconds).await;
    }
}

impl<C: CoordinationStore + 'static> Drop for ReaderLease<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let coordination = self.coordination.clone();
        let keys = std::mem::take(&mut self.keys);
        let ttl_seconds = self.ttl_seconds;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_reader(coordination.as_ref(), &keys, ttl_seconds).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    refcount = ?keys.get(1),
                    "No runtime to release query reader, lease will expire"
                );
            }
        }
    }
}

async fn release_reader<C>(coordination: &C, keys: &[String], ttl_seconds: u64)
where
    C: CoordinationStore + ?Sized,
{
    match coordination
        .eval(CacheScript::Release, keys, &[int_arg(ttl_seconds as i64)])
        .await
    {
        Ok(reply) => {
            tracing::trace!(refcount = ?keys.get(1), reply = reply.as_str(), "Released query reader");
        }
        Err(err) => {
            tracing::warn!(
                refcount = ?keys.get(1),
                error = %err,
                "Failed to release query reader, lease will expire"
            );
        }
    }
}
