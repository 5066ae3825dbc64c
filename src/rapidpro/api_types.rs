//! Serde-deserializable types matching RapidPro API responses.

use serde::Deserialize;

/// One page of a paginated v1 endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
  #[serde(default)]
  pub count: Option<u64>,
  /// Absolute URL of the next page, if any
  pub next: Option<String>,
  #[serde(default = "Vec::new")]
  pub results: Vec<T>,
}
