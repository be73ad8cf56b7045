//! In-memory backing store implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::RwLock;
use uuid::Uuid;

use cachegate_core::entity::{Entity, Key};
use cachegate_core::geo::{self, GeoPoint};
use cachegate_core::query::{evaluate, Query};
use cachegate_core::storage::{
    BackingStore, ColumnImpact, EntityBatchStream, KeyedEntityStream, ModifiedEntity,
    RepositoryError, Result, Transaction, WriteObserver, WriteOperation,
};

/// Default number of entities per streamed batch.
const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
struct Row {
    entity: Entity,
    version: u64,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put(Entity, WriteOperation),
    Delete(Key),
}

#[derive(Debug)]
struct PendingTransaction {
    namespace: String,
    /// Versions observed by reads, 0 meaning "absent".
    reads: HashMap<String, u64>,
    writes: Vec<(String, PendingWrite)>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<String, BTreeMap<String, Row>>,
    transactions: HashMap<Uuid, PendingTransaction>,
    version: u64,
}

impl State {
    fn pending(&self, txn: &Transaction) -> Result<&PendingTransaction> {
        self.transactions
            .get(&txn.id())
            .ok_or_else(|| RepositoryError::TransactionClosed(txn.id().to_string()))
    }

    fn pending_mut(&mut self, txn: &Transaction) -> Result<&mut PendingTransaction> {
        self.transactions
            .get_mut(&txn.id())
            .ok_or_else(|| RepositoryError::TransactionClosed(txn.id().to_string()))
    }

    fn committed(&self, namespace: &str, encoded: &str) -> Option<&Row> {
        self.namespaces.get(namespace)?.get(encoded)
    }

    /// Committed state overlaid with the transaction's own buffered writes.
    fn visible(
        &self,
        namespace: &str,
        txn: Option<&PendingTransaction>,
    ) -> BTreeMap<String, (Entity, u64)> {
        let mut view: BTreeMap<String, (Entity, u64)> = self
            .namespaces
            .get(namespace)
            .map(|rows| {
                rows.iter()
                    .map(|(k, row)| (k.clone(), (row.entity.clone(), row.version)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(txn) = txn {
            for (encoded, write) in &txn.writes {
                match write {
                    PendingWrite::Put(entity, _) => {
                        let version = view.get(encoded).map_or(0, |(_, v)| *v);
                        view.insert(encoded.clone(), (entity.clone(), version));
                    }
                    PendingWrite::Delete(_) => {
                        view.remove(encoded);
                    }
                }
            }
        }
        view
    }

    /// Applies writes all-or-nothing, returning what each one modified.
    fn apply(
        &mut self,
        namespace: &str,
        writes: &[(String, PendingWrite)],
    ) -> Result<Vec<ModifiedEntity>> {
        let mut rows = self.namespaces.get(namespace).cloned().unwrap_or_default();
        let mut version = self.version;
        let mut modified = Vec::with_capacity(writes.len());

        for (encoded, write) in writes {
            match write {
                PendingWrite::Put(entity, operation) => {
                    let previous = rows.get(encoded).map(|row| &row.entity);
                    let entry = match (operation, previous) {
                        (WriteOperation::Create, Some(_)) => {
                            return Err(RepositoryError::AlreadyExists {
                                kind: entity.kind().to_string(),
                                key: encoded.clone(),
                            })
                        }
                        (WriteOperation::Update, None) => {
                            return Err(RepositoryError::NotFound {
                                kind: entity.kind().to_string(),
                                key: encoded.clone(),
                            })
                        }
                        (WriteOperation::Update, Some(previous)) => {
                            ModifiedEntity::updated(entity, Some(previous))
                        }
                        (operation, previous) => {
                            let mut entry = ModifiedEntity::written(entity, *operation);
                            if let (ColumnImpact::Everything(columns), Some(previous)) =
                                (&mut entry.impact, previous)
                            {
                                columns.extend(previous.columns());
                            }
                            entry
                        }
                    };
                    version += 1;
                    rows.insert(
                        encoded.clone(),
                        Row {
                            entity: stored_copy(entity),
                            version,
                        },
                    );
                    modified.push(entry);
                }
                PendingWrite::Delete(key) => {
                    rows.remove(encoded);
                    modified.push(ModifiedEntity::deleted(key.clone()));
                }
            }
        }

        self.namespaces.insert(namespace.to_string(), rows);
        self.version = version;
        Ok(modified)
    }
}

/// Copy of an entity without its loaded snapshot.
fn stored_copy(entity: &Entity) -> Entity {
    let mut stored = Entity::new(entity.key.clone());
    stored.properties = entity.properties.clone();
    stored
}

fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Splits radius results into the four quadrants around the center, the
/// way a range-scan decomposition would hand them back.
fn quadrant_partitions(entities: Vec<Entity>, field: &str, center: GeoPoint) -> Vec<Vec<Entity>> {
    let mut partitions: Vec<Vec<Entity>> = vec![Vec::new(); 4];
    for entity in entities {
        let Some(point) = entity.get(field).and_then(|v| v.as_geo_point()) else {
            continue;
        };
        let north = usize::from(point.latitude >= center.latitude);
        let east = usize::from(point.longitude >= center.longitude);
        partitions[north * 2 + east].push(entity);
    }
    partitions
}

/// Transactional in-memory document store.
///
/// Rows live in per-namespace `BTreeMap`s keyed by encoded key, behind a
/// single `Arc<RwLock<_>>`. Transactions buffer their writes and are checked
/// optimistically at commit: any row read by the transaction that changed
/// since makes the commit fail with `RepositoryError::Conflict`.
///
/// Data is not persisted and will be lost when the store is dropped.
#[derive(Clone)]
pub struct InMemoryBackingStore {
    state: Arc<RwLock<State>>,
    observers: Arc<std::sync::RwLock<Vec<Arc<dyn WriteObserver>>>>,
    next_id: Arc<AtomicI64>,
    batch_size: usize,
    query_calls: Arc<AtomicU64>,
    load_calls: Arc<AtomicU64>,
}

impl Default for InMemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackingStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            observers: Arc::new(std::sync::RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            batch_size: DEFAULT_BATCH_SIZE,
            query_calls: Arc::new(AtomicU64::new(0)),
            load_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets how many entities each streamed batch carries.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of `query` calls served so far.
    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::Relaxed)
    }

    /// Number of `load` and `batch_load` calls served so far.
    pub fn load_calls(&self) -> u64 {
        self.load_calls.load(Ordering::Relaxed)
    }

    fn allocate(&self, key: &Key) -> Key {
        if key.is_complete() {
            return key.clone();
        }
        key.with_allocated_id(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Validates keys and turns entities into pending writes.
    fn prepare_puts(
        &self,
        namespace: &str,
        entities: &[Entity],
        operation: WriteOperation,
    ) -> Result<Vec<(String, PendingWrite)>> {
        entities
            .iter()
            .map(|entity| -> Result<(String, PendingWrite)> {
                let key = match operation {
                    WriteOperation::Create | WriteOperation::Upsert => self.allocate(&entity.key),
                    _ => entity.key.clone(),
                };
                key.ensure_namespace(namespace)?;
                let encoded = key.encode()?;
                let mut entity = entity.clone();
                entity.key = key;
                Ok((encoded, PendingWrite::Put(entity, operation)))
            })
            .collect()
    }

    fn prepare_deletes(&self, namespace: &str, keys: &[Key]) -> Result<Vec<(String, PendingWrite)>> {
        keys.iter()
            .map(|key| -> Result<(String, PendingWrite)> {
                key.ensure_namespace(namespace)?;
                Ok((key.encode()?, PendingWrite::Delete(key.clone())))
            })
            .collect()
    }

    /// Applies writes now, or buffers them on the transaction.
    async fn write(
        &self,
        namespace: &str,
        writes: Vec<(String, PendingWrite)>,
        txn: Option<&Transaction>,
    ) -> Result<()> {
        if let Some(txn) = txn {
            let mut state = self.state.write().await;
            let pending = state.pending_mut(txn)?;
            ensure_same_namespace(&pending.namespace, namespace)?;
            pending.writes.extend(writes);
            return Ok(());
        }

        let modified = {
            let mut state = self.state.write().await;
            state.apply(namespace, &writes)?
        };
        self.notify(namespace, &modified).await;
        Ok(())
    }

    async fn notify(&self, namespace: &str, modified: &[ModifiedEntity]) {
        if modified.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn WriteObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer.entities_modified(namespace, modified).await;
        }
    }

    fn batches(&self, entities: Vec<Entity>, query: &Query) -> Vec<Vec<Entity>> {
        match &query.geo {
            Some(clause) => {
                let partitions = quadrant_partitions(entities, &clause.field, clause.center);
                geo::merge_partitions(partitions, clause, query.limit)
            }
            None => chunk(entities, self.batch_size),
        }
    }
}

fn ensure_same_namespace(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(RepositoryError::InvalidData(format!(
            "transaction belongs to namespace '{}', not '{}'",
            expected, actual
        )));
    }
    Ok(())
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn load(
        &self,
        namespace: &str,
        key: &Key,
        txn: Option<&Transaction>,
    ) -> Result<Option<Entity>> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        key.ensure_namespace(namespace)?;
        let encoded = key.encode()?;

        let Some(txn) = txn else {
            let state = self.state.read().await;
            return Ok(state
                .committed(namespace, &encoded)
                .map(|row| row.entity.clone().mark_loaded()));
        };

        let mut state = self.state.write().await;
        let committed_version = state.committed(namespace, &encoded).map_or(0, |r| r.version);
        let view = state.visible(namespace, Some(state.pending(txn)?));
        let pending = state.pending_mut(txn)?;
        ensure_same_namespace(&pending.namespace, namespace)?;
        pending.reads.entry(encoded.clone()).or_insert(committed_version);
        Ok(view.get(&encoded).map(|(entity, _)| entity.clone().mark_loaded()))
    }

    async fn batch_load(
        &self,
        namespace: &str,
        keys: &[Key],
        txn: Option<&Transaction>,
    ) -> Result<KeyedEntityStream> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let entity = self.load(namespace, key, txn).await?;
            results.push((key.clone(), entity));
        }
        let batches = chunk(results, self.batch_size);
        Ok(stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn query(
        &self,
        namespace: &str,
        query: &Query,
        txn: Option<&Transaction>,
    ) -> Result<EntityBatchStream> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(ancestor) = &query.ancestor {
            ancestor.ensure_namespace(namespace)?;
        }

        let mut unlimited = query.clone();
        if unlimited.geo.is_some() {
            unlimited.limit = None;
        }

        let results = {
            let mut state = self.state.write().await;
            let pending = match txn {
                Some(txn) => {
                    let pending = state.pending(txn)?;
                    ensure_same_namespace(&pending.namespace, namespace)?;
                    Some(pending)
                }
                None => None,
            };
            let view = state.visible(namespace, pending);
            let results = evaluate(view.values().map(|(entity, _)| entity), &unlimited);

            if let Some(txn) = txn {
                let pending = state.pending_mut(txn)?;
                for entity in &results {
                    let encoded = entity.key.encode()?;
                    let version = view.get(&encoded).map_or(0, |(_, v)| *v);
                    pending.reads.entry(encoded).or_insert(version);
                }
            }
            results
        };

        let batches: Vec<Vec<Entity>> = self
            .batches(results, query)
            .into_iter()
            .map(|batch| batch.into_iter().map(Entity::mark_loaded).collect())
            .collect();
        Ok(stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn create(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>> {
        let writes = self.prepare_puts(namespace, entities, WriteOperation::Create)?;
        let keys = written_keys(&writes);
        self.write(namespace, writes, txn).await?;
        Ok(keys)
    }

    async fn upsert(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<Vec<Key>> {
        let writes = self.prepare_puts(namespace, entities, WriteOperation::Upsert)?;
        let keys = written_keys(&writes);
        self.write(namespace, writes, txn).await?;
        Ok(keys)
    }

    async fn update(
        &self,
        namespace: &str,
        entities: &[Entity],
        txn: Option<&Transaction>,
    ) -> Result<()> {
        let writes = self.prepare_puts(namespace, entities, WriteOperation::Update)?;
        self.write(namespace, writes, txn).await
    }

    async fn delete(
        &self,
        namespace: &str,
        keys: &[Key],
        txn: Option<&Transaction>,
    ) -> Result<()> {
        let writes = self.prepare_deletes(namespace, keys)?;
        self.write(namespace, writes, txn).await
    }

    async fn begin_transaction(&self, namespace: &str) -> Result<Transaction> {
        let txn = Transaction::new(namespace);
        let mut state = self.state.write().await;
        state.transactions.insert(
            txn.id(),
            PendingTransaction {
                namespace: namespace.to_string(),
                reads: HashMap::new(),
                writes: Vec::new(),
            },
        );
        tracing::trace!(txn = %txn.id(), namespace, "Transaction started");
        Ok(txn)
    }

    async fn commit(&self, txn: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        let pending = state
            .transactions
            .remove(&txn.id())
            .ok_or_else(|| RepositoryError::TransactionClosed(txn.id().to_string()))?;

        for (encoded, seen) in &pending.reads {
            let current = state
                .committed(&pending.namespace, encoded)
                .map_or(0, |row| row.version);
            if current != *seen {
                return Err(RepositoryError::Conflict(format!(
                    "{} changed since it was read",
                    encoded
                )));
            }
        }

        let modified = state.apply(&pending.namespace, &pending.writes)?;
        drop(state);
        txn.record_modified(modified).await;
        tracing::trace!(txn = %txn.id(), "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, txn: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .transactions
            .remove(&txn.id())
            .ok_or_else(|| RepositoryError::TransactionClosed(txn.id().to_string()))?;
        tracing::trace!(txn = %txn.id(), "Transaction rolled back");
        Ok(())
    }

    fn subscribe(&self, observer: Arc<dyn WriteObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }
}

fn written_keys(writes: &[(String, PendingWrite)]) -> Vec<Key> {
    writes
        .iter()
        .filter_map(|(_, write)| match write {
            PendingWrite::Put(entity, _) => Some(entity.key.clone()),
            PendingWrite::Delete(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachegate_core::entity::KeyError;
    use cachegate_core::query::{FilterOp, SortDirection};
    use futures_util::TryStreamExt;
    use std::collections::BTreeSet;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<ModifiedEntity>>,
    }

    #[async_trait]
    impl WriteObserver for RecordingObserver {
        async fn entities_modified(&self, _namespace: &str, modified: &[ModifiedEntity]) {
            self.seen.lock().await.extend_from_slice(modified);
        }
    }

    fn widget(id: i64, color: &str, size: i64) -> Entity {
        Entity::new(Key::with_id("ns", "Widget", id))
            .with("color", color)
            .with("size", size)
    }

    async fn collect(stream: EntityBatchStream) -> Vec<Entity> {
        let batches: Vec<Vec<Entity>> = stream.try_collect().await.unwrap();
        batches.into_iter().flatten().collect()
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryBackingStore::new();
        let entity = widget(1, "red", 1);

        store.create("ns", &[entity.clone()], None).await.unwrap();
        let loaded = store.load("ns", &entity.key, None).await.unwrap().unwrap();

        assert_eq!(loaded, entity);
        assert!(loaded.is_loaded());
    }

    #[tokio::test]
    async fn test_create_allocates_ids() {
        let store = InMemoryBackingStore::new();
        let entity = Entity::new(Key::incomplete("ns", "Widget")).with("color", "red");

        let keys = store
            .create("ns", &[entity.clone(), entity], None)
            .await
            .unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(Key::is_complete));
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = InMemoryBackingStore::new();
        store.create("ns", &[widget(1, "red", 1)], None).await.unwrap();

        let result = store.create("ns", &[widget(1, "blue", 1)], None).await;

        assert!(matches!(result, Err(RepositoryError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = InMemoryBackingStore::new();
        let result = store.update("ns", &[widget(1, "red", 1)], None).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = InMemoryBackingStore::new();
        let result = store
            .delete("ns", &[Key::with_id("ns", "Widget", 9)], None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cross_namespace_key_is_rejected() {
        let store = InMemoryBackingStore::new();
        let result = store
            .load("other", &Key::with_id("ns", "Widget", 1), None)
            .await;

        assert!(matches!(
            result,
            Err(RepositoryError::InvalidKey(KeyError::CrossNamespace { .. }))
        ));
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_limits() {
        let store = InMemoryBackingStore::new().with_batch_size(1);
        store
            .create(
                "ns",
                &[widget(1, "red", 3), widget(2, "blue", 1), widget(3, "red", 2)],
                None,
            )
            .await
            .unwrap();

        let query = Query::kind("Widget")
            .filter("color", FilterOp::Equal, "red")
            .order_by("size", SortDirection::Ascending)
            .limit(1);
        let results = collect(store.query("ns", &query, None).await.unwrap()).await;

        assert_eq!(results, vec![widget(3, "red", 2)]);
        assert_eq!(store.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_streams_batches() {
        let store = InMemoryBackingStore::new().with_batch_size(2);
        let widgets: Vec<Entity> = (1..=5).map(|i| widget(i, "red", i)).collect();
        store.create("ns", &widgets, None).await.unwrap();

        let batches: Vec<Vec<Entity>> = store
            .query("ns", &Query::kind("Widget"), None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[tokio::test]
    async fn test_ancestor_query() {
        let store = InMemoryBackingStore::new();
        let parent = Key::with_id("ns", "Shelf", 1);
        let child = Entity::new(parent.child("Widget", cachegate_core::entity::KeyId::Id(7)))
            .with("color", "red");
        store
            .create("ns", &[child.clone(), widget(8, "red", 1)], None)
            .await
            .unwrap();

        let query = Query::kind("Widget").ancestor(parent);
        let results = collect(store.query("ns", &query, None).await.unwrap()).await;

        assert_eq!(results, vec![child]);
    }

    #[tokio::test]
    async fn test_geo_sorted_query_yields_one_merged_batch() {
        let store = InMemoryBackingStore::new();
        let center = GeoPoint::new(0.0, 0.0);
        let places: Vec<Entity> = [(0.01, 0.01), (-0.002, 0.0), (0.0, -0.005), (5.0, 5.0)]
            .iter()
            .enumerate()
            .map(|(i, (lat, lng))| {
                Entity::new(Key::with_id("ns", "Place", i as i64 + 1))
                    .with("location", GeoPoint::new(*lat, *lng))
            })
            .collect();
        store.create("ns", &places, None).await.unwrap();

        let query = Query::kind("Place")
            .near("location", center, 5_000.0, Some(SortDirection::Ascending))
            .limit(2);
        let batches: Vec<Vec<Entity>> = store
            .query("ns", &query, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(batches.len(), 1);
        let ids: Vec<Key> = batches[0].iter().map(|e| e.key.clone()).collect();
        assert_eq!(
            ids,
            vec![Key::with_id("ns", "Place", 2), Key::with_id("ns", "Place", 3)]
        );
    }

    #[tokio::test]
    async fn test_non_transactional_write_notifies_observers() {
        let store = InMemoryBackingStore::new();
        let observer = Arc::new(RecordingObserver::default());
        store.subscribe(observer.clone());

        store.create("ns", &[widget(1, "red", 1)], None).await.unwrap();
        let mut loaded = store
            .load("ns", &Key::with_id("ns", "Widget", 1), None)
            .await
            .unwrap()
            .unwrap();
        loaded.set("color", "blue");
        store.update("ns", &[loaded], None).await.unwrap();

        let seen = observer.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].operation, WriteOperation::Create);
        assert_eq!(
            seen[1].impact,
            ColumnImpact::Columns(BTreeSet::from(["color".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_transaction_commit_records_modifications() {
        let store = InMemoryBackingStore::new();
        let observer = Arc::new(RecordingObserver::default());
        store.subscribe(observer.clone());

        let txn = store.begin_transaction("ns").await.unwrap();
        store
            .create("ns", &[widget(1, "red", 1)], Some(&txn))
            .await
            .unwrap();

        // Not visible outside the transaction until commit.
        assert!(store
            .load("ns", &Key::with_id("ns", "Widget", 1), None)
            .await
            .unwrap()
            .is_none());

        store.commit(&txn).await.unwrap();

        assert!(observer.seen.lock().await.is_empty());
        assert_eq!(txn.take_modified().await.len(), 1);
        assert!(store
            .load("ns", &Key::with_id("ns", "Widget", 1), None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_transaction_conflict() {
        let store = InMemoryBackingStore::new();
        store.create("ns", &[widget(1, "red", 1)], None).await.unwrap();
        let key = Key::with_id("ns", "Widget", 1);

        let txn = store.begin_transaction("ns").await.unwrap();
        store.load("ns", &key, Some(&txn)).await.unwrap();
        store.upsert("ns", &[widget(1, "blue", 1)], None).await.unwrap();
        store
            .update("ns", &[widget(1, "green", 1)], Some(&txn))
            .await
            .unwrap();

        let result = store.commit(&txn).await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        let stored = store.load("ns", &key, None).await.unwrap().unwrap();
        assert_eq!(stored.get("color"), Some(&"blue".into()));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_closes() {
        let store = InMemoryBackingStore::new();
        let txn = store.begin_transaction("ns").await.unwrap();
        store
            .create("ns", &[widget(1, "red", 1)], Some(&txn))
            .await
            .unwrap();

        store.rollback(&txn).await.unwrap();

        assert!(store
            .load("ns", &Key::with_id("ns", "Widget", 1), None)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.commit(&txn).await,
            Err(RepositoryError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_reads_its_own_writes() {
        let store = InMemoryBackingStore::new();
        let txn = store.begin_transaction("ns").await.unwrap();
        store
            .create("ns", &[widget(1, "red", 1)], Some(&txn))
            .await
            .unwrap();

        let results = collect(
            store
                .query("ns", &Query::kind("Widget"), Some(&txn))
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(results.len(), 1);
    }
}
