//! Caching implementations for RapidPro types.

use color_eyre::Result;
use std::collections::BTreeMap;

use crate::cache::{CacheStorage, Cacheable};

use super::types::{Contact, Flow, Kind, Record, Run};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Run {
  type Key = i64;

  fn cache_key(&self) -> i64 {
    self.id
  }

  fn entity_type() -> &'static str {
    Kind::Run.name()
  }
}

impl Cacheable for Flow {
  type Key = String;

  fn cache_key(&self) -> String {
    self.uuid.clone()
  }

  fn entity_type() -> &'static str {
    Kind::Flow.name()
  }
}

impl Cacheable for Contact {
  type Key = String;

  fn cache_key(&self) -> String {
    self.uuid.clone()
  }

  fn entity_type() -> &'static str {
    Kind::Contact.name()
  }
}

// ============================================================================
// Mixed-kind operations
// ============================================================================

/// Record-level operations on any cache storage.
pub trait RecordCache: CacheStorage {
  /// Insert records of any kind, skipping ones already cached.
  ///
  /// Each kind is written in its own transaction, so the batch as a whole is
  /// best effort rather than atomic.
  fn insert_records(&self, records: &[Record]) -> Result<usize> {
    let mut runs = Vec::new();
    let mut flows = Vec::new();
    let mut contacts = Vec::new();

    for record in records {
      match record {
        Record::Run(run) => runs.push(run.clone()),
        Record::Flow(flow) => flows.push(flow.clone()),
        Record::Contact(contact) => contacts.push(contact.clone()),
      }
    }

    Ok(self.insert(&runs)? + self.insert(&flows)? + self.insert(&contacts)?)
  }

  /// Number of cached records per kind.
  fn kind_counts(&self) -> Result<BTreeMap<Kind, usize>> {
    let mut counts = BTreeMap::new();
    for (entity_type, count) in self.counts()? {
      counts.insert(entity_type.parse::<Kind>()?, count);
    }
    Ok(counts)
  }
}

impl<S: CacheStorage> RecordCache for S {}
