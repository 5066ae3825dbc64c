//! Generic append-only object cache.
//!
//! This module provides a RapidPro-agnostic caching mechanism that:
//! - Stores serialized entities keyed by (entity type, key)
//! - Never overwrites an entity once stored, so repeated inserts are no-ops
//! - Answers batched lookups with the hit entities and the missing keys

mod storage;
mod traits;

pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheLookup, Cacheable};
