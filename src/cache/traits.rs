//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for entities that can be cached.
///
/// An entity is identified by its type name plus its key. The pair is unique
/// within a store and a stored entity is never replaced.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Identity of the entity within its type (e.g., run id, flow uuid)
  type Key: Clone + Eq + Hash + Display + Debug + Send + Sync;

  /// Unique identifier for this entity
  fn cache_key(&self) -> Self::Key;

  /// Entity type name for storage organization (e.g., "run", "flow")
  fn entity_type() -> &'static str;
}

/// Outcome of a batched lookup: the stored entities that matched and the keys
/// that did not.
///
/// `hits` and `misses` partition the requested key set.
#[derive(Debug, Clone)]
pub struct CacheLookup<T: Cacheable> {
  /// Stored entities whose key was requested, in no particular order
  pub hits: Vec<T>,
  /// Requested keys with no stored entity
  pub misses: HashSet<T::Key>,
}

impl<T: Cacheable> CacheLookup<T> {
  /// A lookup where nothing was found.
  pub fn all_missing(keys: &HashSet<T::Key>) -> Self {
    Self {
      hits: Vec::new(),
      misses: keys.clone(),
    }
  }
}
