//! Query fills.
//!
//! The reader that wins `obtain` spawns a producer task that pulls batches
//! from the backing store, appends each one to `QDATA` and forwards it over
//! a bounded channel. The producer outlives its consumer: if the caller
//! stops reading early, the fill still runs to `finalize`, so a started fill
//! always ends finalized or discarded.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};

use cachegate_core::cache::{
    cached_in_key, epoch_key, int_arg, query_buckets, serialize_entities, str_arg, CacheError,
    CacheScript, CoordinationStore, Fingerprint, QueryKeys, ScriptReply,
};
use cachegate_core::entity::Entity;
use cachegate_core::query::Query;
use cachegate_core::storage::{BackingStore, EntityBatchStream, RepositoryError, Result};

use crate::config::CacheSettings;
use crate::telemetry::{CacheStats, ReadPath};

use super::is_cancelled;

/// How a fill ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FillOutcome {
    /// The result list was promoted to `QCACHE`.
    Finalized,
    /// A write raced the fill; nothing was cached.
    Discarded,
    /// The backing store failed or the caller cancelled.
    Abandoned,
}

type Batch = Result<Vec<Entity>>;

pub(super) struct FillJob<B, C>
where
    B: BackingStore,
    C: CoordinationStore,
{
    pub backing: Arc<B>,
    pub coordination: Arc<C>,
    pub settings: Arc<CacheSettings>,
    pub stats: Arc<CacheStats>,
    pub namespace: String,
    pub query: Query,
    pub fingerprint: Fingerprint,
    pub epoch: i64,
    pub token: String,
    pub cancel: watch::Receiver<bool>,
}

impl<B, C> FillJob<B, C>
where
    B: BackingStore + 'static,
    C: CoordinationStore + 'static,
{
    /// Starts the producer and returns the caller's side of the channel.
    pub fn start(self) -> EntityBatchStream {
        let (tx, mut rx) = mpsc::channel::<Batch>(self.settings.fill_buffer);
        let cancel = self.cancel.clone();
        let fingerprint = self.fingerprint.clone();
        let producer = tokio::spawn(self.run(tx));

        let stream = async_stream::stream! {
            let mut cancelled = false;
            while let Some(item) = rx.recv().await {
                if is_cancelled(&cancel) {
                    cancelled = true;
                    break;
                }
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }

            // Unblocks a producer waiting on a full channel.
            drop(rx);
            match producer.await {
                Ok(outcome) => {
                    tracing::trace!(%fingerprint, ?outcome, "Query fill finished");
                }
                Err(err) => {
                    tracing::warn!(%fingerprint, error = %err, "Query fill task failed");
                }
            }

            if cancelled {
                yield Err(RepositoryError::Cancelled);
            }
        };

        stream.boxed()
    }

    async fn run(self, tx: mpsc::Sender<Batch>) -> FillOutcome {
        let mut consumer = Some(tx);
        let mut results = match self.backing.query(&self.namespace, &self.query, None).await {
            Ok(results) => results,
            Err(err) => {
                self.abandon("backing store failed").await;
                forward(&mut consumer, Err(err)).await;
                return FillOutcome::Abandoned;
            }
        };

        let mut storing = true;
        let mut stored = 0usize;
        while let Some(item) = results.next().await {
            if is_cancelled(&self.cancel) {
                if storing {
                    self.abandon("cancelled").await;
                }
                forward(&mut consumer, Err(RepositoryError::Cancelled)).await;
                return FillOutcome::Abandoned;
            }

            let batch = match item {
                Ok(batch) => batch,
                Err(err) => {
                    if storing {
                        self.abandon("backing store failed").await;
                    }
                    forward(&mut consumer, Err(err)).await;
                    return FillOutcome::Abandoned;
                }
            };

            self.stats
                .record_misses(&self.query.kind, ReadPath::Query, batch.len() as u64);

            if storing && !batch.is_empty() {
                match self.append(&batch).await {
                    Ok(ScriptReply::Written) => {
                        stored += batch.len();
                        self.stats.record_writes(&self.query.kind, batch.len() as u64);
                    }
                    Ok(reply) => {
                        tracing::debug!(
                            fingerprint = %self.fingerprint,
                            reply = reply.as_str(),
                            "Query fill invalidated"
                        );
                        storing = false;
                        self.abandon("invalidated").await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            fingerprint = %self.fingerprint,
                            error = %err,
                            "Failed to append to query cache"
                        );
                        storing = false;
                        self.abandon("append failed").await;
                    }
                }
            }

            forward(&mut consumer, Ok(batch)).await;
            if consumer.is_none() && !storing {
                return FillOutcome::Discarded;
            }
        }

        if !storing {
            return FillOutcome::Discarded;
        }
        if is_cancelled(&self.cancel) {
            self.abandon("cancelled").await;
            return FillOutcome::Abandoned;
        }
        self.finalize(stored).await
    }

    async fn append(&self, batch: &[Entity]) -> std::result::Result<ScriptReply, CacheError> {
        let keys = QueryKeys::new(&self.fingerprint);
        let mut script_keys = Vec::with_capacity(batch.len() + 3);
        script_keys.push(epoch_key(&self.query.kind));
        script_keys.push(keys.data);
        script_keys.push(keys.writer);
        for entity in batch {
            let index = cached_in_key(&entity.key)
                .map_err(|err| CacheError::Serialization(err.to_string()))?;
            script_keys.push(index);
        }

        let mut args = Vec::with_capacity(batch.len() + 5);
        args.push(int_arg(self.epoch));
        args.push(str_arg(self.fingerprint.as_str()));
        args.push(str_arg(&self.token));
        args.push(int_arg(self.settings.index_ttl_seconds as i64));
        args.push(int_arg(self.settings.writer_lease_seconds as i64));
        args.extend(serialize_entities(batch)?);

        self.coordination
            .eval(CacheScript::AppendFill, &script_keys, &args)
            .await
    }

    async fn finalize(&self, stored: usize) -> FillOutcome {
        let mut keys = vec![epoch_key(&self.query.kind)];
        keys.extend(QueryKeys::new(&self.fingerprint).to_vec());
        keys.extend(query_buckets(&self.namespace, &self.query));

        let args = [
            int_arg(self.epoch),
            str_arg(self.fingerprint.as_str()),
            str_arg(&self.token),
            int_arg(self.settings.query_ttl_seconds as i64),
            int_arg(self.settings.index_ttl_seconds as i64),
        ];

        match self
            .coordination
            .eval(CacheScript::FinalizeFill, &keys, &args)
            .await
        {
            Ok(ScriptReply::Written) => {
                tracing::debug!(fingerprint = %self.fingerprint, count = stored, "Query cache filled");
                FillOutcome::Finalized
            }
            Ok(reply) => {
                tracing::debug!(
                    fingerprint = %self.fingerprint,
                    reply = reply.as_str(),
                    "Query fill discarded at finalize"
                );
                FillOutcome::Discarded
            }
            Err(err) => {
                tracing::warn!(fingerprint = %self.fingerprint, error = %err, "Failed to finalize query fill");
                self.abandon("finalize failed").await;
                FillOutcome::Abandoned
            }
        }
    }

    async fn abandon(&self, reason: &str) {
        let keys = QueryKeys::new(&self.fingerprint);
        let script_keys = [keys.data, keys.writer];
        match self
            .coordination
            .eval(CacheScript::AbandonFill, &script_keys, &[str_arg(&self.token)])
            .await
        {
            Ok(reply) => {
                tracing::debug!(
                    fingerprint = %self.fingerprint,
                    reason,
                    reply = reply.as_str(),
                    "Query fill abandoned"
                );
            }
            Err(err) => {
                tracing::warn!(
                    fingerprint = %self.fingerprint,
                    reason,
                    error = %err,
                    "Failed to abandon query fill, writer lease will expire"
                );
            }
        }
    }
}

/// Sends to the consumer, forgetting it once it hung up.
async fn forward(consumer: &mut Option<mpsc::Sender<Batch>>, item: Batch) {
    if let Some(tx) = consumer {
        if tx.send(item).await.is_err() {
            tracing::trace!("Query consumer went away, fill continues");
            *consumer = None;
        }
    }
}
