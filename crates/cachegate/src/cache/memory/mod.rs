//! In-memory coordination store.
//!
//! Implements every primitive and script of the coordination protocol over a
//! locked keyspace, for single-process deployments and tests.

mod keyspace;
mod scripts;
mod store;

pub use store::MemoryCoordinationStore;
