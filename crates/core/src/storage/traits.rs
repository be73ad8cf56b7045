use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{Entity, Key};
use crate::query::Query;

use super::{EntityBatchStream, KeyedEntityStream, ModifiedEntity, Result, Transaction};

/// Transactional document store.
///
/// Every read and write takes an optional transaction. Writes made outside
/// a transaction notify the subscribed [`WriteObserver`]s once they are
/// durable; writes inside a transaction are recorded as [`ModifiedEntity`]
/// entries on the [`Transaction`] handle when it commits.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Loads one entity.
    async fn load(
        &self,
        namespace: &str,
        key: &Key,
        txn: Option<&Transaction>,
    ) -> Result<Option<Entity>>;

    /// Loads many entities, streaming results in batches.
    async fn batch_load(
        &self,
        namespace: &str,
        keys: &[Key],
        txn: Option<&Transaction>,
    ) -> Result<KeyedEntityStream>;

    /// Runs a query, streaming results in batches.
    async fn query(
        &self,
        namespace: &str,
        query: &Query,
        txn: Option<&Transaction>,
    ) -> Result<EntityBatchStream>;

    /// Inserts new entities, allocating ids for incomplete keys. Returns the
    /// final keys in input order.
    async fn create(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>>;

    /// Inserts or replaces entities.
    async fn upsert(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>>;

    /// Replaces existing entities.
    async fn update(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<()>;

    /// Deletes entities. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, keys: &[Key], txn: Option<&Transaction>)
        -> Result<()>;

    async fn begin_transaction(&self, namespace: &str) -> Result<Transaction>;

    /// Commits the transaction and records what it modified on `txn`.
    async fn commit(&self, txn: &Transaction) -> Result<()>;

    async fn rollback(&self, txn: &Transaction) -> Result<()>;

    /// Registers an observer for non-transactional writes.
    fn subscribe(&self, observer: Arc<dyn WriteObserver>);
}

/// Receives the "entities modified" notification after every
/// non-transactional write.
#[async_trait]
pub trait WriteObserver: Send + Sync {
    async fn entities_modified(&self, namespace: &str, modified: &[ModifiedEntity]);
}
