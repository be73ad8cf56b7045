//! Write-driven invalidation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use cachegate_core::cache::{
    cached_in_key, entity_key, epoch_key, modification_buckets, CacheError, CacheScript,
    CoordinationStore, Fingerprint, QueryKeys, ScriptReply,
};
use cachegate_core::storage::{ModifiedEntity, WriteObserver};

use crate::config::CacheSettings;
use crate::telemetry::{self, CacheStats};

/// What one invalidation pass touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Kinds whose epoch was bumped.
    pub kinds: Vec<String>,
    /// `ENTITY:*` keys that existed and were deleted.
    pub entities_evicted: u64,
    /// Fingerprints found through `CACHEDIN` and index buckets.
    pub queries_found: usize,
    /// Queries purged outright or detached from their readers.
    pub queries_purged: usize,
    /// Queries whose in-flight fill was flagged.
    pub fills_flagged: usize,
}

/// Drops cached state affected by committed writes.
///
/// The pass runs in a fixed order:
///
/// 1. Bump `EPOCH:{kind}` of every modified kind, so fills that read the
///    backing store before the write can no longer be promoted.
/// 2. Delete the modified `ENTITY:*` keys.
/// 3. Collect fingerprints from each key's `CACHEDIN` set and from the
///    index buckets the write touched, removing exactly those members.
/// 4. Purge every collected query.
///
/// Members are removed before the purge, so a fill that registers itself
/// after step 3 either gets purged in step 4 or keeps its registration.
pub struct Invalidator<C: CoordinationStore> {
    coordination: Arc<C>,
    settings: Arc<CacheSettings>,
    stats: Arc<CacheStats>,
}

impl<C: CoordinationStore> Invalidator<C> {
    pub fn new(coordination: Arc<C>, settings: Arc<CacheSettings>, stats: Arc<CacheStats>) -> Self {
        Self {
            coordination,
            settings,
            stats,
        }
    }

    /// Runs one invalidation pass.
    ///
    /// Every step is attempted even after an earlier one failed; the first
    /// error is returned once the pass is over.
    pub async fn invalidate(
        &self,
        namespace: &str,
        modified: &[ModifiedEntity],
    ) -> Result<InvalidationReport, CacheError> {
        let mut report = InvalidationReport::default();
        if modified.is_empty() {
            return Ok(report);
        }

        let started_at = Instant::now();
        let mut first_error: Option<CacheError> = None;
        let mut keep = |result: Result<(), CacheError>| {
            if let Err(err) = result {
                tracing::warn!(error = %err, "Invalidation step failed");
                first_error.get_or_insert(err);
            }
        };

        let kinds: BTreeSet<&str> = modified.iter().map(|m| m.key.kind()).collect();
        for kind in &kinds {
            keep(self.coordination.incr(&epoch_key(kind)).await.map(|_| ()));
            report.kinds.push(kind.to_string());
        }

        let mut entity_keys = Vec::with_capacity(modified.len());
        let mut index_keys = Vec::with_capacity(modified.len());
        for m in modified {
            match (entity_key(&m.key), cached_in_key(&m.key)) {
                (Ok(entity), Ok(index)) => {
                    entity_keys.push(entity);
                    index_keys.push((m.key.kind(), index));
                }
                (Err(err), _) | (_, Err(err)) => {
                    tracing::warn!(key = ?m.key, error = %err, "Skipping unencodable key");
                }
            }
        }

        for chunk in entity_keys.chunks(self.settings.invalidation_chunk) {
            match self.coordination.delete(chunk).await {
                Ok(removed) => report.entities_evicted += removed,
                Err(err) => keep(Err(err)),
            }
        }

        // Fingerprint -> kind it was found through, for per-kind counters.
        let mut queries: BTreeMap<String, &str> = BTreeMap::new();
        for (kind, index) in &index_keys {
            keep(self.drain_set(index, *kind, &mut queries).await);
        }

        let mut buckets: BTreeMap<String, &str> = BTreeMap::new();
        for m in modified {
            for bucket in modification_buckets(namespace, m) {
                buckets.entry(bucket).or_insert(m.key.kind());
            }
        }
        for (bucket, kind) in &buckets {
            keep(self.drain_set(bucket, *kind, &mut queries).await);
        }

        report.queries_found = queries.len();
        let mut flushed: BTreeMap<&str, u64> = BTreeMap::new();
        for (hex, kind) in &queries {
            let keys = QueryKeys::new(&Fingerprint::from_hex(hex.as_str()));
            match self
                .coordination
                .eval(CacheScript::PurgeQuery, &keys.to_vec(), &[])
                .await
            {
                Ok(ScriptReply::WriterFlagged) => {
                    report.fills_flagged += 1;
                    *flushed.entry(*kind).or_default() += 1;
                }
                Ok(ScriptReply::Purged | ScriptReply::Detached) => {
                    report.queries_purged += 1;
                    *flushed.entry(*kind).or_default() += 1;
                }
                Ok(reply) => {
                    tracing::trace!(fingerprint = %hex, reply = %reply.as_str(), "Query already gone");
                }
                Err(err) => keep(Err(err)),
            }
        }
        for (kind, count) in flushed {
            self.stats.record_flushed(kind, count);
        }

        telemetry::record_cache_elapsed(started_at);
        tracing::debug!(
            namespace,
            kinds = ?report.kinds,
            entities = report.entities_evicted,
            queries = report.queries_found,
            purged = report.queries_purged,
            flagged = report.fills_flagged,
            "Invalidated cached state"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Runs [`Invalidator::invalidate`], logging instead of returning errors.
    ///
    /// The write has already committed at this point, so a failure can only
    /// leave stale entries behind until their TTL runs out.
    pub async fn invalidate_logged(&self, namespace: &str, modified: &[ModifiedEntity]) {
        if let Err(err) = self.invalidate(namespace, modified).await {
            tracing::error!(
                namespace,
                count = modified.len(),
                error = %err,
                "Cache invalidation incomplete, stale entries may be served until they expire"
            );
        }
    }

    /// Moves the members of `set` into `queries` and removes them from it.
    async fn drain_set<'k>(
        &self,
        set: &str,
        kind: &'k str,
        queries: &mut BTreeMap<String, &'k str>,
    ) -> Result<(), CacheError> {
        let members = self.coordination.smembers(set).await?;
        if members.is_empty() {
            return Ok(());
        }
        self.coordination.srem(set, &members).await?;
        for member in members {
            queries.entry(member).or_insert(kind);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: CoordinationStore + 'static> WriteObserver for Invalidator<C> {
    async fn entities_modified(&self, namespace: &str, modified: &[ModifiedEntity]) {
        self.invalidate_logged(namespace, modified).await;
    }
}
