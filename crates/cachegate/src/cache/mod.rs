//! Coordination store implementations.
//!
//! This module provides concrete implementations of the
//! `cachegate_core::cache::CoordinationStore` trait.
//!
//! # Feature Flags
//!
//! - always: in-memory store using tokio synchronization primitives
//! - `redis`: Redis store using the redis crate, shared across processes

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_impl;

pub use memory::MemoryCoordinationStore;

#[cfg(feature = "redis")]
pub use redis_impl::RedisCoordinationStore;
