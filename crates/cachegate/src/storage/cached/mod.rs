//! Cache coordinator.
//!
//! [`CachedStore`] wraps any [`BackingStore`] and serves reads through a
//! [`CoordinationStore`]. It is a drop-in replacement for the store it wraps:
//!
//! - **Entity reads**: check `ENTITY:{key}`, on a miss load from the backing
//!   store and fill the entry unless the kind's epoch moved meanwhile
//! - **Queries**: readers share one cached result list per fingerprint, and
//!   exactly one reader at a time fills it while streaming its own results
//! - **Writes**: delegate to the backing store; the registered
//!   [`Invalidator`] then drops every cached entity and query the write may
//!   have affected
//! - **Transactions**: reads inside a transaction bypass the cache, and the
//!   invalidation runs when the transaction commits
//!
//! Coordination-store failures never fail a read: the coordinator logs them
//! and reads the backing store directly.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! let backing = Arc::new(InMemoryBackingStore::new());
//! let coordination = Arc::new(MemoryCoordinationStore::new());
//! let store = CachedStore::new(backing, coordination, CacheSettings::default());
//!
//! let widget = store.load("ns", &key, None).await?;
//! ```

mod entity;
mod fill;
mod invalidation;
mod query;


use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;

use cachegate_core::cache::{epoch_key, CacheError, CoordinationStore};
use cachegate_core::entity::{Entity, Key};
use cachegate_core::query::Query;
use cachegate_core::storage::{
    BackingStore, EntityBatchStream, KeyedEntityStream, Result, Transaction, WriteObserver,
};

use crate::config::CacheSettings;
use crate::telemetry::{self, CacheStats, CacheStatsSnapshot};

pub use invalidation::{InvalidationReport, Invalidator};

/// Caching decorator over a backing store.
///
/// # Type Parameters
///
/// * `B` - The backing store holding the authoritative data
/// * `C` - The coordination store holding cached entities and queries
pub struct CachedStore<B, C>
where
    B: BackingStore,
    C: CoordinationStore,
{
    backing: Arc<B>,
    coordination: Arc<C>,
    settings: Arc<CacheSettings>,
    stats: Arc<CacheStats>,
    invalidator: Arc<Invalidator<C>>,
}

impl<B, C> CachedStore<B, C>
where
    B: BackingStore + 'static,
    C: CoordinationStore + 'static,
{
    /// Creates the coordinator and subscribes its [`Invalidator`] to the
    /// backing store's write notifications.
    ///
    /// Writes made directly on `backing` are invalidated as well.
    pub fn new(backing: Arc<B>, coordination: Arc<C>, settings: CacheSettings) -> Self {
        let settings = Arc::new(settings);
        let stats = Arc::new(CacheStats::default());
        let invalidator = Arc::new(Invalidator::new(
            coordination.clone(),
            settings.clone(),
            stats.clone(),
        ));
        backing.subscribe(invalidator.clone() as Arc<dyn WriteObserver>);

        Self {
            backing,
            coordination,
            settings,
            stats,
            invalidator,
        }
    }

    pub fn backing(&self) -> &Arc<B> {
        &self.backing
    }

    pub fn coordination(&self) -> &Arc<C> {
        &self.coordination
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn invalidator(&self) -> &Arc<Invalidator<C>> {
        &self.invalidator
    }

    /// Hit, miss, write and flush totals since construction.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Reads the current epoch of `kind`. A missing counter is epoch zero.
pub(crate) async fn read_epoch<C>(coordination: &C, kind: &str) -> std::result::Result<i64, CacheError>
where
    C: CoordinationStore + ?Sized,
{
    let started_at = Instant::now();
    let raw = coordination.get(&epoch_key(kind)).await;
    telemetry::record_cache_elapsed(started_at);

    match raw? {
        None => Ok(0),
        Some(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                CacheError::Serialization(format!("epoch of {} is not an integer", kind))
            }),
    }
}

/// True once the caller flipped the cancellation flag.
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// A cancellation flag nobody will ever raise.
pub(crate) fn never_cancelled() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

#[async_trait]
impl<B, C> BackingStore for CachedStore<B, C>
where
    B: BackingStore + 'static,
    C: CoordinationStore + 'static,
{
    async fn load(
        &self,
        namespace: &str,
        key: &Key,
        txn: Option<&Transaction>,
    ) -> Result<Option<Entity>> {
        match txn {
            Some(txn) => self.backing.load(namespace, key, Some(txn)).await,
            None => self.load_cached(namespace, key).await,
        }
    }

    async fn batch_load(
        &self,
        namespace: &str,
        keys: &[Key],
        txn: Option<&Transaction>,
    ) -> Result<KeyedEntityStream> {
        match txn {
            Some(txn) => self.backing.batch_load(namespace, keys, Some(txn)).await,
            None => self.batch_load_cached(namespace, keys).await,
        }
    }

    async fn query(
        &self,
        namespace: &str,
        query: &Query,
        txn: Option<&Transaction>,
    ) -> Result<EntityBatchStream> {
        match txn {
            Some(txn) => self.backing.query(namespace, query, Some(txn)).await,
            None => {
                self.query_with_cancel(namespace, query, never_cancelled())
                    .await
            }
        }
    }

    async fn create(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>> {
        self.backing.create(namespace, entities, txn).await
    }

    async fn upsert(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>> {
        self.backing.upsert(namespace, entities, txn).await
    }

    async fn update(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<()> {
        self.backing.update(namespace, entities, txn).await
    }

    async fn delete(
        &self,
        namespace: &str,
        keys: &[Key],
        txn: Option<&Transaction>,
    ) -> Result<()> {
        self.backing.delete(namespace, keys, txn).await
    }

    async fn begin_transaction(&self, namespace: &str) -> Result<Transaction> {
        self.backing.begin_transaction(namespace).await
    }

    async fn commit(&self, txn: &Transaction) -> Result<()> {
        self.backing.commit(txn).await?;

        let modified = txn.take_modified().await;
        tracing::debug!(
            txn_id = %txn.id(),
            namespace = txn.namespace(),
            count = modified.len(),
            "Transaction committed, invalidating"
        );
        self.invalidator.invalidate_logged(txn.namespace(), &modified).await;
        Ok(())
    }

    async fn rollback(&self, txn: &Transaction) -> Result<()> {
        self.backing.rollback(txn).await?;
        txn.take_modified().await;
        Ok(())
    }

    fn subscribe(&self, observer: Arc<dyn WriteObserver>) {
        self.backing.subscribe(observer);
    }
}
