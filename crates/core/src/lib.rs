//! Functional core of the cachegate read-through cache.
//!
//! Everything in this crate is free of I/O: data types, key derivation,
//! query fingerprinting, the atomic script catalogue and the traits that the
//! imperative shell (`cachegate`) implements.

pub mod cache;
pub mod entity;
pub mod geo;
pub mod query;
pub mod storage;
