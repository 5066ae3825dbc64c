//! A single pull from RapidPro, reconciled against the local cache.
//!
//! The flow of one pull:
//!
//! 1. Fetch the requested kind from the remote source
//! 2. Swap in the cached copy of every record the cache already holds
//! 3. For runs, resolve the requested associations (flows, contacts), fetching
//!    only the identities the cache does not hold
//! 4. Store every record of the result; records already cached are skipped
//!
//! Caching is disabled by handing the task a [`NoopStorage`](crate::cache::NoopStorage):
//! every lookup misses and nothing is stored, so the same code path degrades to
//! "fetch everything, persist nothing".

use color_eyre::{eyre::bail, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn, Level};

use crate::cache::{CacheLookup, CacheStorage, Cacheable};
use crate::rapidpro::cache::RecordCache;
use crate::rapidpro::source::{Filter, RemoteSource, Resource};
use crate::rapidpro::types::{Association, Contact, Flow, Kind, Record, Run};

/// What to pull.
#[derive(Debug, Clone)]
pub struct PullRequest {
  pub kind: Kind,
  pub filter: Filter,
  /// Only valid when `kind` is [`Kind::Run`]
  pub associations: BTreeSet<Association>,
}

/// Result of a pull. Serializes to a bare JSON array when no associations were
/// requested, otherwise to an object keyed by slot name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Pulled {
  List(Vec<Record>),
  Associated(Associated),
}

/// Runs together with the flows and contacts they reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Associated {
  pub runs: Vec<Run>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub flows: Option<Vec<Flow>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub contacts: Option<Vec<Contact>>,
}

impl Pulled {
  /// Every record in the result, of whatever kind.
  pub fn records(&self) -> Vec<Record> {
    match self {
      Pulled::List(records) => records.clone(),
      Pulled::Associated(associated) => {
        let runs = associated.runs.iter().cloned().map(Record::Run);
        let flows = associated.flows.iter().flatten().cloned().map(Record::Flow);
        let contacts = associated
          .contacts
          .iter()
          .flatten()
          .cloned()
          .map(Record::Contact);
        runs.chain(flows).chain(contacts).collect()
      }
    }
  }
}

/// Replace each entity with its cached copy where one exists.
///
/// Length and order are preserved; entities without a cached copy are kept
/// as fetched.
pub fn substitute<T: Cacheable, S: CacheStorage>(fetched: Vec<T>, store: &S) -> Result<Vec<T>> {
  let keys: HashSet<T::Key> = fetched.iter().map(Cacheable::cache_key).collect();
  let cached: HashMap<T::Key, T> = store
    .get::<T>(&keys)?
    .hits
    .into_iter()
    .map(|entity| (entity.cache_key(), entity))
    .collect();

  Ok(
    fetched
      .into_iter()
      .map(|entity| match cached.get(&entity.cache_key()) {
        Some(stored) => stored.clone(),
        None => entity,
      })
      .collect(),
  )
}

/// Executes one pull against a remote source and a cache.
pub struct PullTask<'a, R, S> {
  remote: &'a R,
  store: &'a S,
}

impl<'a, R: RemoteSource, S: CacheStorage> PullTask<'a, R, S> {
  pub fn new(remote: &'a R, store: &'a S) -> Self {
    Self { remote, store }
  }

  pub async fn run(&self, request: &PullRequest) -> Result<Pulled> {
    let pulled = if request.associations.is_empty() {
      let records = match request.kind {
        Kind::Run => self.fetch_records::<Run>(&request.filter).await?,
        Kind::Flow => self.fetch_records::<Flow>(&request.filter).await?,
        Kind::Contact => self.fetch_records::<Contact>(&request.filter).await?,
      };
      Pulled::List(records)
    } else if request.kind == Kind::Run {
      Pulled::Associated(
        self
          .fetch_associated(&request.filter, &request.associations)
          .await?,
      )
    } else {
      bail!(
        "Associations can only be pulled together with runs, not {}",
        request.kind.endpoint()
      );
    };

    let records = pulled.records();
    let mut per_kind: BTreeMap<Kind, usize> = BTreeMap::new();
    for record in &records {
      *per_kind.entry(record.kind()).or_default() += 1;
    }

    let inserted = self.store.insert_records(&records)?;
    info!(kind = %request.kind, pulled = ?per_kind, inserted, "pull complete");

    // Diagnostics only; the pull has already succeeded
    if tracing::enabled!(Level::DEBUG) {
      match self.store.kind_counts() {
        Ok(cached) => debug!(cached = ?cached, "cache contents"),
        Err(e) => warn!(error = %e, "failed to count cache contents"),
      }
    }

    Ok(pulled)
  }

  async fn fetch_substituted<T: Resource>(&self, filter: &Filter) -> Result<Vec<T>> {
    let fetched = self.remote.fetch::<T>(filter).await?;
    info!(kind = %T::KIND, fetched = fetched.len(), "fetched from remote");
    substitute(fetched, self.store)
  }

  async fn fetch_records<T: Resource>(&self, filter: &Filter) -> Result<Vec<Record>> {
    let entities = self.fetch_substituted::<T>(filter).await?;
    Ok(entities.into_iter().map(T::into_record).collect())
  }

  async fn fetch_associated(
    &self,
    filter: &Filter,
    associations: &BTreeSet<Association>,
  ) -> Result<Associated> {
    let runs = self.fetch_substituted::<Run>(filter).await?;
    let mut associated = Associated {
      runs,
      ..Associated::default()
    };

    for association in associations {
      match association {
        Association::Flows => {
          let uuids = associated.runs.iter().map(|run| run.flow.clone()).collect();
          associated.flows = Some(self.resolve::<Flow>(uuids).await?);
        }
        Association::Contacts => {
          let uuids = associated
            .runs
            .iter()
            .map(|run| run.contact.clone())
            .collect();
          associated.contacts = Some(self.resolve::<Contact>(uuids).await?);
        }
      }
    }

    Ok(associated)
  }

  /// Cached entities for `keys`, plus the rest fetched from the remote.
  async fn resolve<T: Resource<Key = String>>(&self, keys: HashSet<String>) -> Result<Vec<T>> {
    let CacheLookup { mut hits, misses } = self.store.get::<T>(&keys)?;
    info!(
      kind = %T::KIND,
      hits = hits.len(),
      misses = misses.len(),
      "resolved associations"
    );

    // An empty id filter would fetch the whole endpoint
    if !misses.is_empty() {
      hits.extend(self.remote.fetch::<T>(&Filter::by_ids(misses)).await?);
    }

    Ok(hits)
  }
}
