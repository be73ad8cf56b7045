//! Storage implementations.
//!
//! - [`inmemory`]: a transactional backing store kept in process memory
//! - [`cached`]: the cache coordinator, a [`BackingStore`] decorator that
//!   serves reads through a coordination store
//!
//! [`BackingStore`]: cachegate_core::storage::BackingStore

pub mod cached;
pub mod inmemory;

pub use cached::{CachedStore, InvalidationReport, Invalidator};
pub use inmemory::InMemoryBackingStore;
