use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Key, Value};

/// A document stored in the backing store.
///
/// `snapshot` holds the properties as they were when the entity was loaded,
/// so updates can report exactly which columns changed. It is never
/// serialized and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub key: Key,
    pub properties: BTreeMap<String, Value>,
    #[serde(skip)]
    snapshot: Option<BTreeMap<String, Value>>,
}

impl Entity {
    /// Creates a fresh entity that has never been loaded.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
            snapshot: None,
        }
    }

    /// Sets a property (builder style).
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.properties.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.properties.remove(column)
    }

    pub fn kind(&self) -> &str {
        self.key.kind()
    }

    /// Marks the current properties as the loaded state.
    ///
    /// Backing-store adapters call this on every entity they return.
    pub fn mark_loaded(mut self) -> Self {
        self.snapshot = Some(self.properties.clone());
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Every column currently present on the entity.
    pub fn columns(&self) -> BTreeSet<String> {
        self.properties.keys().cloned().collect()
    }

    /// Columns whose value differs from the loaded snapshot.
    ///
    /// Returns `None` when the entity was never loaded, in which case callers
    /// must assume every column changed.
    pub fn changed_columns(&self) -> Option<BTreeSet<String>> {
        let snapshot = self.snapshot.as_ref()?;
        Some(diff_columns(snapshot, &self.properties))
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.properties == other.properties
    }
}

/// Structural diff of two property maps, returning the names of columns
/// added, removed or modified.
pub fn diff_columns(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (column, value) in after {
        if before.get(column) != Some(value) {
            changed.insert(column.clone());
        }
    }
    for column in before.keys() {
        if !after.contains_key(column) {
            changed.insert(column.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> Entity {
        Entity::new(Key::with_id("ns", "Widget", 1))
            .with("color", "red")
            .with("size", 3)
    }

    #[test]
    fn test_never_loaded_has_no_diff() {
        assert_eq!(widget().changed_columns(), None);
    }

    #[test]
    fn test_changed_columns_after_load() {
        let mut entity = widget().mark_loaded();
        entity.set("color", "blue");
        entity.set("size", 3);

        let changed = entity.changed_columns().unwrap();

        assert_eq!(changed, BTreeSet::from(["color".to_string()]));
    }

    #[test]
    fn test_added_and_removed_columns_are_changes() {
        let mut entity = widget().mark_loaded();
        entity.remove("size");
        entity.set("weight", 2.5);

        let changed = entity.changed_columns().unwrap();

        assert_eq!(
            changed,
            BTreeSet::from(["size".to_string(), "weight".to_string()])
        );
    }

    #[test]
    fn test_type_change_is_a_change() {
        let mut entity = widget().mark_loaded();
        entity.set("size", 3.0);

        assert_eq!(
            entity.changed_columns().unwrap(),
            BTreeSet::from(["size".to_string()])
        );
    }

    #[test]
    fn test_equality_ignores_snapshot() {
        assert_eq!(widget(), widget().mark_loaded());
    }

    #[test]
    fn test_serialization_skips_snapshot() {
        let entity = widget().mark_loaded();
        let json = serde_json::to_string(&entity).unwrap();
        let back: Entity = serde_json::from_str(&json).unwrap();

        assert_eq!(back, entity);
        assert!(!back.is_loaded());
    }
}
