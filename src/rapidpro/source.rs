//! The contract between the reconciler and whatever serves RapidPro records.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::Result;
use std::collections::BTreeSet;

use crate::cache::Cacheable;

use super::types::{Contact, Flow, Kind, Record, Run};

/// Restricts which records an endpoint returns.
///
/// An empty `ids` set means "no identity filter".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
  pub before: Option<DateTime<Utc>>,
  pub after: Option<DateTime<Utc>>,
  pub ids: BTreeSet<String>,
}

impl Filter {
  /// Filter on an explicit identity set only.
  pub fn by_ids<I, K>(ids: I) -> Self
  where
    I: IntoIterator<Item = K>,
    K: ToString,
  {
    Self {
      ids: ids.into_iter().map(|id| id.to_string()).collect(),
      ..Self::default()
    }
  }

  /// Time bounds as query parameters, in the format RapidPro expects.
  pub fn time_params(&self) -> Vec<(&'static str, String)> {
    let format = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);

    let mut params = Vec::new();
    if let Some(before) = &self.before {
      params.push(("before", format(before)));
    }
    if let Some(after) = &self.after {
      params.push(("after", format(after)));
    }
    params
  }
}

/// A record kind that can be fetched from a remote source and cached.
pub trait Resource: Cacheable + Sized {
  const KIND: Kind;

  fn into_record(self) -> Record;
}

impl Resource for Run {
  const KIND: Kind = Kind::Run;

  fn into_record(self) -> Record {
    Record::Run(self)
  }
}

impl Resource for Flow {
  const KIND: Kind = Kind::Flow;

  fn into_record(self) -> Record {
    Record::Flow(self)
  }
}

impl Resource for Contact {
  const KIND: Kind = Kind::Contact;

  fn into_record(self) -> Record {
    Record::Contact(self)
  }
}

/// Something that serves RapidPro records by kind and filter.
///
/// Implementations report unreachable hosts and rejected credentials as
/// [`RemoteError`](super::error::RemoteError) so callers can tell them apart.
#[allow(async_fn_in_trait)]
pub trait RemoteSource {
  async fn fetch<T: Resource>(&self, filter: &Filter) -> Result<Vec<T>>;
}
