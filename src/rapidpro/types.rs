use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::error::UnknownKind;

/// The three record kinds served by RapidPro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
  Run,
  Flow,
  Contact,
}

impl Kind {
  /// Stable name used as the storage entity type.
  pub fn name(self) -> &'static str {
    match self {
      Kind::Run => "run",
      Kind::Flow => "flow",
      Kind::Contact => "contact",
    }
  }

  /// API endpoint name (`/api/v1/<endpoint>.json`).
  pub fn endpoint(self) -> &'static str {
    match self {
      Kind::Run => "runs",
      Kind::Flow => "flows",
      Kind::Contact => "contacts",
    }
  }

  /// Query parameter that filters the endpoint by identity.
  pub fn id_param(self) -> &'static str {
    match self {
      Kind::Run => "run",
      Kind::Flow | Kind::Contact => "uuid",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Kind {
  type Err = UnknownKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "run" => Ok(Kind::Run),
      "flow" => Ok(Kind::Flow),
      "contact" => Ok(Kind::Contact),
      other => Err(UnknownKind(other.to_string())),
    }
  }
}

/// Secondary kinds that can be pulled alongside runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Association {
  Flows,
  Contacts,
}

/// A flow run. `run` is the identity; `flow_uuid` and `contact` reference
/// the flow and contact it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
  #[serde(rename = "run")]
  pub id: i64,
  #[serde(rename = "flow_uuid")]
  pub flow: String,
  pub contact: String,
  /// Remaining fields, kept verbatim
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
  pub uuid: String,
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
  pub uuid: String,
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

/// Any record served by RapidPro.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
  Run(Run),
  Flow(Flow),
  Contact(Contact),
}

impl Record {
  pub fn kind(&self) -> Kind {
    match self {
      Record::Run(_) => Kind::Run,
      Record::Flow(_) => Kind::Flow,
      Record::Contact(_) => Kind::Contact,
    }
  }
}
