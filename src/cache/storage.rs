//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::traits::{CacheLookup, Cacheable};

/// Keys bound per `IN (...)` lookup, kept well under SQLite's variable limit.
const LOOKUP_CHUNK: usize = 500;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store entities, skipping any whose (type, key) is already present.
  ///
  /// Returns the number of entities actually written.
  fn insert<T: Cacheable>(&self, entities: &[T]) -> Result<usize>;

  /// Look up a set of keys in one pass.
  fn get<T: Cacheable>(&self, keys: &HashSet<T::Key>) -> Result<CacheLookup<T>>;

  /// Get a single entity by key.
  #[cfg(test)]
  fn lookup_one<T: Cacheable>(&self, key: &T::Key) -> Result<Option<T>> {
    let keys = HashSet::from([key.clone()]);
    Ok(self.get::<T>(&keys)?.hits.into_iter().next())
  }

  /// Number of stored entities per entity type.
  fn counts(&self) -> Result<BTreeMap<String, usize>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn insert<T: Cacheable>(&self, _entities: &[T]) -> Result<usize> {
    Ok(0) // Discard
  }

  fn get<T: Cacheable>(&self, keys: &HashSet<T::Key>) -> Result<CacheLookup<T>> {
    Ok(CacheLookup::all_missing(keys)) // Always miss
  }

  fn counts(&self) -> Result<BTreeMap<String, usize>> {
    Ok(BTreeMap::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    debug!(path = %path.display(), "opened cache database");

    Self::with_connection(conn)
  }

  /// Open a cache that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Append-only entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);
"#;

impl CacheStorage for SqliteStorage {
  fn insert<T: Cacheable>(&self, entities: &[T]) -> Result<usize> {
    if entities.is_empty() {
      return Ok(0);
    }

    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entity_type = T::entity_type();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut inserted = 0;
    {
      // OR IGNORE: an existing (entity_type, entity_key) row is left untouched
      let mut stmt = tx
        .prepare(
          "INSERT OR IGNORE INTO entity_cache (entity_type, entity_key, data, cached_at)
           VALUES (?, ?, ?, datetime('now'))",
        )
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for entity in entities {
        let entity_key = entity.cache_key().to_string();
        let data =
          serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

        inserted += stmt
          .execute(params![entity_type, entity_key, data])
          .map_err(|e| eyre!("Failed to store {} {}: {}", entity_type, entity_key, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(
      entity_type,
      offered = entities.len(),
      inserted,
      "stored entities"
    );
    Ok(inserted)
  }

  fn get<T: Cacheable>(&self, keys: &HashSet<T::Key>) -> Result<CacheLookup<T>> {
    if keys.is_empty() {
      return Ok(CacheLookup::all_missing(keys));
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entity_type = T::entity_type();

    let wanted: Vec<String> = keys.iter().map(ToString::to_string).collect();
    let mut hits: Vec<T> = Vec::new();

    for chunk in wanted.chunks(LOOKUP_CHUNK) {
      let placeholders = vec!["?"; chunk.len()].join(", ");
      let sql = format!(
        "SELECT data FROM entity_cache WHERE entity_type = ? AND entity_key IN ({})",
        placeholders
      );

      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

      let mut bound: Vec<&str> = Vec::with_capacity(chunk.len() + 1);
      bound.push(entity_type);
      bound.extend(chunk.iter().map(String::as_str));

      let rows = stmt
        .query_map(params_from_iter(bound), |row| row.get::<_, Vec<u8>>(0))
        .map_err(|e| eyre!("Failed to query entities: {}", e))?;

      for row in rows {
        let data = row.map_err(|e| eyre!("Failed to read cached entity: {}", e))?;
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cached {}: {}", entity_type, e))?;
        hits.push(entity);
      }
    }

    let found: HashSet<T::Key> = hits.iter().map(Cacheable::cache_key).collect();
    let misses = keys.difference(&found).cloned().collect();

    Ok(CacheLookup { hits, misses })
  }


  fn counts(&self) -> Result<BTreeMap<String, usize>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT entity_type, COUNT(*) FROM entity_cache GROUP BY entity_type")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let counts = stmt
      .query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
      })
      .map_err(|e| eyre!("Failed to count entities: {}", e))?
      .collect::<rusqlite::Result<BTreeMap<_, _>>>()
      .map_err(|e| eyre!("Failed to count entities: {}", e))?;

    Ok(counts)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: u32,
    body: String,
  }

  impl Cacheable for Item {
    type Key = u32;

    fn cache_key(&self) -> u32 {
      self.id
    }

    fn entity_type() -> &'static str {
      "item"
    }
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Tag {
    name: String,
  }

  impl Cacheable for Tag {
    type Key = String;

    fn cache_key(&self) -> String {
      self.name.clone()
    }

    fn entity_type() -> &'static str {
      "tag"
    }
  }

  fn item(id: u32, body: &str) -> Item {
    Item {
      id,
      body: body.to_string(),
    }
  }

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_insert_twice_is_idempotent() {
    let storage = storage();

    assert_eq!(storage.insert(&[item(1, "a")]).unwrap(), 1);
    assert_eq!(storage.insert(&[item(1, "a")]).unwrap(), 0);

    assert_eq!(storage.counts().unwrap().get("item"), Some(&1));
    assert_eq!(storage.lookup_one::<Item>(&1).unwrap(), Some(item(1, "a")));
  }

  #[test]
  fn test_insert_never_overwrites() {
    let storage = storage();
    storage.insert(&[item(1, "first")]).unwrap();

    let inserted = storage
      .insert(&[item(1, "changed"), item(2, "new")])
      .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(
      storage.lookup_one::<Item>(&1).unwrap(),
      Some(item(1, "first"))
    );
  }

  #[test]
  fn test_duplicates_within_one_batch() {
    let storage = storage();

    let inserted = storage.insert(&[item(7, "first"), item(7, "second")]).unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(storage.lookup_one::<Item>(&7).unwrap(), Some(item(7, "first")));
  }

  #[test]
  fn test_get_partitions_keys() {
    let storage = storage();
    storage
      .insert(&[item(1, "a"), item(2, "b"), item(5, "e")])
      .unwrap();

    let keys = HashSet::from([1, 2, 3, 4]);
    let lookup = storage.get::<Item>(&keys).unwrap();

    let hit_keys: HashSet<u32> = lookup.hits.iter().map(|i| i.id).collect();
    assert_eq!(hit_keys, HashSet::from([1, 2]));
    assert_eq!(lookup.misses, HashSet::from([3, 4]));
    assert!(hit_keys.is_disjoint(&lookup.misses));
    assert_eq!(
      hit_keys.union(&lookup.misses).copied().collect::<HashSet<_>>(),
      keys
    );
  }

  #[test]
  fn test_get_all_present_has_no_misses() {
    let storage = storage();
    storage.insert(&[item(1, "a"), item(2, "b")]).unwrap();

    let lookup = storage.get::<Item>(&HashSet::from([1, 2])).unwrap();

    assert_eq!(lookup.hits.len(), 2);
    assert!(lookup.misses.is_empty());
  }

  #[test]
  fn test_get_empty_key_set() {
    let storage = storage();

    let lookup = storage.get::<Item>(&HashSet::new()).unwrap();

    assert!(lookup.hits.is_empty());
    assert!(lookup.misses.is_empty());
  }

  #[test]
  fn test_get_more_keys_than_one_chunk() {
    let storage = storage();
    let items: Vec<Item> = (0..1200).map(|i| item(i, "x")).collect();
    storage.insert(&items).unwrap();

    let keys: HashSet<u32> = (600..1300).collect();
    let lookup = storage.get::<Item>(&keys).unwrap();

    assert_eq!(lookup.hits.len(), 600);
    assert_eq!(lookup.misses, (1200..1300).collect::<HashSet<u32>>());
  }

  #[test]
  fn test_entity_types_are_separate_namespaces() {
    let storage = storage();
    storage.insert(&[item(1, "a")]).unwrap();
    storage
      .insert(&[Tag {
        name: "1".to_string(),
      }])
      .unwrap();

    assert_eq!(storage.lookup_one::<Item>(&1).unwrap(), Some(item(1, "a")));
    assert!(storage.lookup_one::<Tag>(&"2".to_string()).unwrap().is_none());

    let counts = storage.counts().unwrap();
    assert_eq!(counts.get("item"), Some(&1));
    assert_eq!(counts.get("tag"), Some(&1));
  }

  #[test]
  fn test_lookup_one_missing() {
    let storage = storage();
    assert!(storage.lookup_one::<Item>(&42).unwrap().is_none());
  }

  #[test]
  fn test_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.insert(&[item(1, "a")]).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.insert(&[item(1, "b")]).unwrap(), 0);
    assert_eq!(storage.lookup_one::<Item>(&1).unwrap(), Some(item(1, "a")));
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;

    assert_eq!(storage.insert(&[item(1, "a")]).unwrap(), 0);
    assert!(storage.lookup_one::<Item>(&1).unwrap().is_none());

    let lookup = storage.get::<Item>(&HashSet::from([1, 2])).unwrap();
    assert!(lookup.hits.is_empty());
    assert_eq!(lookup.misses, HashSet::from([1, 2]));
    assert!(storage.counts().unwrap().is_empty());
  }
}
