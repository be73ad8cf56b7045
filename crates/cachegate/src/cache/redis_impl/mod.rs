//! Redis coordination store.
//!
//! Shares cache state between every process that points at the same Redis
//! server. Requires Redis 6.0 or newer (`SET ... KEEPTTL`).

mod error;
mod store;

pub use store::RedisCoordinationStore;
