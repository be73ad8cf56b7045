use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entity::{diff_columns, Entity, Key};

use super::Result;

/// Batches of query results, in backing-store order.
pub type EntityBatchStream = BoxStream<'static, Result<Vec<Entity>>>;

/// Batches of `(key, entity)` pairs produced by a batched load. Missing
/// entities are reported as `None`.
pub type KeyedEntityStream = BoxStream<'static, Result<Vec<(Key, Option<Entity>)>>>;

/// Kind of write that modified an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperation {
    Create,
    Upsert,
    Update,
    Delete,
}

/// Which column index buckets a write may have affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnImpact {
    /// No prior snapshot to diff against: the kind-wide bucket plus every
    /// listed column.
    Everything(BTreeSet<String>),
    /// Only these columns changed value.
    Columns(BTreeSet<String>),
    /// The entity went away; only queries that contained it are affected.
    KeyOnly,
}

/// One entity touched by a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedEntity {
    pub key: Key,
    pub operation: WriteOperation,
    pub impact: ColumnImpact,
}

impl ModifiedEntity {
    /// Describes a create or upsert of `entity`.
    pub fn written(entity: &Entity, operation: WriteOperation) -> Self {
        Self {
            key: entity.key.clone(),
            operation,
            impact: ColumnImpact::Everything(entity.columns()),
        }
    }

    /// Describes an update of the stored row `previous` by `entity`.
    ///
    /// The impact is every column that differs from the stored row, plus
    /// every column changed since the entity was loaded. A stale loaded copy
    /// can revert columns another writer changed, and only the stored row
    /// shows that. Without a snapshot the impact covers all columns of both.
    pub fn updated(entity: &Entity, previous: Option<&Entity>) -> Self {
        let impact = match (entity.changed_columns(), previous) {
            (Some(mut changed), Some(previous)) => {
                changed.extend(diff_columns(&previous.properties, &entity.properties));
                ColumnImpact::Columns(changed)
            }
            (Some(changed), None) => ColumnImpact::Columns(changed),
            (None, previous) => {
                let mut columns = entity.columns();
                if let Some(previous) = previous {
                    columns.extend(previous.columns());
                }
                ColumnImpact::Everything(columns)
            }
        };
        Self {
            key: entity.key.clone(),
            operation: WriteOperation::Update,
            impact,
        }
    }

    pub fn deleted(key: Key) -> Self {
        Self {
            key,
            operation: WriteOperation::Delete,
            impact: ColumnImpact::KeyOnly,
        }
    }
}

/// Handle to an open backing-store transaction.
///
/// Cloning shares the same underlying transaction. Adapters record the
/// entities each transactional write modifies; the cache layer drains them
/// after a successful commit.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: Uuid,
    namespace: String,
    modified: Arc<Mutex<Vec<ModifiedEntity>>>,
}

impl Transaction {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            modified: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Appends entities modified by a write inside this transaction.
    pub async fn record_modified(&self, entries: impl IntoIterator<Item = ModifiedEntity>) {
        self.modified.lock().await.extend(entries);
    }

    /// Removes and returns everything recorded so far.
    pub async fn take_modified(&self) -> Vec<ModifiedEntity> {
        std::mem::take(&mut *self.modified.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_reports_every_column() {
        let entity = Entity::new(Key::with_id("ns", "Widget", 1))
            .with("color", "red")
            .with("size", 1);

        let modified = ModifiedEntity::written(&entity, WriteOperation::Create);

        assert_eq!(
            modified.impact,
            ColumnImpact::Everything(BTreeSet::from(["color".to_string(), "size".to_string()]))
        );
    }

    #[test]
    fn test_updated_diffs_loaded_entity() {
        let mut entity = Entity::new(Key::with_id("ns", "Widget", 1))
            .with("color", "red")
            .mark_loaded();
        entity.set("color", "blue");

        let modified = ModifiedEntity::updated(&entity, None);

        assert_eq!(
            modified.impact,
            ColumnImpact::Columns(BTreeSet::from(["color".to_string()]))
        );
    }

    #[test]
    fn test_updated_includes_columns_reverted_from_stored_row() {
        let mut entity = Entity::new(Key::with_id("ns", "Widget", 1))
            .with("color", "red")
            .with("size", 1)
            .mark_loaded();
        entity.set("size", 5);
        let previous = Entity::new(Key::with_id("ns", "Widget", 1))
            .with("color", "blue")
            .with("size", 1);

        let modified = ModifiedEntity::updated(&entity, Some(&previous));

        assert_eq!(
            modified.impact,
            ColumnImpact::Columns(BTreeSet::from(["color".to_string(), "size".to_string()]))
        );
    }

    #[test]
    fn test_updated_without_snapshot_includes_previous_columns() {
        let previous = Entity::new(Key::with_id("ns", "Widget", 1)).with("legacy", true);
        let entity = Entity::new(Key::with_id("ns", "Widget", 1)).with("color", "red");

        let modified = ModifiedEntity::updated(&entity, Some(&previous));

        assert_eq!(
            modified.impact,
            ColumnImpact::Everything(BTreeSet::from(["color".to_string(), "legacy".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_transaction_records_and_drains() {
        let txn = Transaction::new("ns");
        let shared = txn.clone();

        shared
            .record_modified([ModifiedEntity::deleted(Key::with_id("ns", "Widget", 1))])
            .await;

        assert_eq!(txn.take_modified().await.len(), 1);
        assert!(txn.take_modified().await.is_empty());
        assert_eq!(txn.id(), shared.id());
    }
}
