//! Pure functions for converting entities to and from cache payloads.
//!
//! Payloads are JSON so that cached values stay readable with `redis-cli`.
//! Deserialized entities are marked as loaded: they carry a snapshot that a
//! later update can diff against.

use crate::entity::Entity;

use super::{CacheError, Result};

/// Serializes an entity to JSON bytes.
pub fn serialize_entity(entity: &Entity) -> Result<Vec<u8>> {
    serde_json::to_vec(entity).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Deserializes JSON bytes to a loaded entity.
pub fn deserialize_entity(bytes: &[u8]) -> Result<Entity> {
    serde_json::from_slice::<Entity>(bytes)
        .map(Entity::mark_loaded)
        .map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Serializes a batch of entities, one payload each.
pub fn serialize_entities(entities: &[Entity]) -> Result<Vec<Vec<u8>>> {
    entities.iter().map(serialize_entity).collect()
}

/// Deserializes a window of payloads read back from `QDATA`.
pub fn deserialize_entities(payloads: &[Vec<u8>]) -> Result<Vec<Entity>> {
    payloads.iter().map(|p| deserialize_entity(p)).collect()
}
