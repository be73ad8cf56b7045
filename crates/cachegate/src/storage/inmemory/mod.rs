//! In-memory backing store.
//!
//! This module provides a transactional document store that keeps all data
//! in `BTreeMap`s wrapped in `Arc<RwLock<_>>`. It backs the tests, the
//! `demo` command and single-process deployments where persistence is not
//! required.
//!
//! # Example
//!
//! ```rust,ignore
//! use cachegate::storage::inmemory::InMemoryBackingStore;
//!
//! let store = InMemoryBackingStore::new().with_batch_size(100);
//! let keys = store.create("ns", &[entity], None).await?;
//! ```

mod repository;

pub use repository::InMemoryBackingStore;
