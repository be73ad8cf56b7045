//! Read-through cache coordination for transactional document stores.
//!
//! [`storage::CachedStore`] wraps a [`BackingStore`] and a
//! [`CoordinationStore`]. Point lookups and query results are shared between
//! every process talking to the same coordination store, and a committed
//! write never lets a reader observe results from before it.
//!
//! [`BackingStore`]: cachegate_core::storage::BackingStore
//! [`CoordinationStore`]: cachegate_core::cache::CoordinationStore

pub mod cache;
pub mod config;
pub mod storage;
pub mod telemetry;

pub use config::CacheSettings;
pub use storage::{CachedStore, InMemoryBackingStore};
