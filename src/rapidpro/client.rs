use color_eyre::{eyre::eyre, Report, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::ApiPage;
use super::error::RemoteError;
use super::source::{Filter, RemoteSource, Resource};
use super::types::Kind;

/// Identities sent per request when filtering by id.
const ID_CHUNK: usize = 100;

/// RapidPro v1 API client
#[derive(Clone)]
pub struct RapidProClient {
  http: reqwest::Client,
  base: Url,
}

impl RapidProClient {
  pub fn new(address: &str, token: &str, timeout: Duration) -> Result<Self> {
    let base = base_url(address)?;

    let mut auth = HeaderValue::from_str(&format!("Token {}", token))
      .map_err(|_| eyre!("API token contains characters not allowed in a header"))?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  fn endpoint(&self, kind: Kind) -> Result<Url> {
    self
      .base
      .join(&format!("api/v1/{}.json", kind.endpoint()))
      .map_err(|e| eyre!("Failed to build {} endpoint URL: {}", kind.endpoint(), e))
  }

  /// Fetch every page of an endpoint, following `next` links.
  async fn fetch_all<T: DeserializeOwned>(
    &self,
    kind: Kind,
    mut query: Vec<(&'static str, String)>,
  ) -> Result<Vec<T>> {
    let mut results = Vec::new();
    let mut next = Some(self.endpoint(kind)?);

    while let Some(url) = next.take() {
      let page: ApiPage<T> = self.get_page(url.clone(), &query).await?;
      debug!(
        url = %url,
        total = ?page.count,
        received = page.results.len(),
        "fetched page"
      );

      // Subsequent page links already carry the query
      query.clear();
      results.extend(page.results);

      next = page
        .next
        .as_deref()
        .map(Url::parse)
        .transpose()
        .map_err(|e| eyre!("Invalid next page link for {}: {}", kind.endpoint(), e))?;
    }

    Ok(results)
  }

  async fn get_page<T: DeserializeOwned>(
    &self,
    url: Url,
    query: &[(&'static str, String)],
  ) -> Result<ApiPage<T>> {
    let response = self
      .http
      .get(url)
      .query(query)
      .send()
      .await
      .map_err(transport_error)?;

    let status = response.status();
    if is_auth_failure(status) {
      return Err(RemoteError::Authentication.into());
    }
    if !status.is_success() {
      return Err(eyre!("RapidPro returned {} for {}", status, response.url()));
    }

    response
      .json::<ApiPage<T>>()
      .await
      .map_err(|e| eyre!("Failed to parse RapidPro response: {}", e))
  }
}

impl RemoteSource for RapidProClient {
  async fn fetch<T: Resource>(&self, filter: &Filter) -> Result<Vec<T>> {
    let kind = T::KIND;

    if filter.ids.is_empty() {
      return self.fetch_all(kind, filter.time_params()).await;
    }

    let ids: Vec<&String> = filter.ids.iter().collect();
    let mut results = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
      let mut query = filter.time_params();
      query.extend(chunk.iter().map(|id| (kind.id_param(), id.to_string())));
      results.extend(self.fetch_all::<T>(kind, query).await?);
    }

    debug!(kind = %kind, requested = ids.len(), received = results.len(), "fetched by id");
    Ok(results)
  }
}

/// Normalise a user-supplied address into a base URL ending in `/`.
///
/// A bare host such as `rapidpro.io` is served over https.
fn base_url(address: &str) -> Result<Url> {
  let address = address.trim().trim_end_matches('/');
  let with_scheme = if address.contains("://") {
    address.to_string()
  } else {
    format!("https://{}", address)
  };

  Url::parse(&format!("{}/", with_scheme))
    .map_err(|e| eyre!("Invalid RapidPro address '{}': {}", address, e))
}

fn is_auth_failure(status: StatusCode) -> bool {
  status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn transport_error(e: reqwest::Error) -> Report {
  if e.is_connect() || e.is_timeout() {
    RemoteError::Connection {
      reason: e.to_string(),
    }
    .into()
  } else {
    eyre!("Request to RapidPro failed: {}", e)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rapidpro::types::{Contact, Flow, Run};
  use serde_json::json;
  use std::sync::{Arc, Mutex};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve HTTP/1.1 on a loopback port, one request per connection.
  ///
  /// The handler gets the request target and the server root and returns the
  /// status and JSON body. Returns the root URL and the log of targets.
  async fn serve<F>(handler: F) -> (String, Arc<Mutex<Vec<String>>>)
  where
    F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let root = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    let server_root = root.clone();
    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
          let n = socket.read(&mut buf).await.unwrap();
          if n == 0 {
            break;
          }
          head.extend_from_slice(&buf[..n]);
        }

        let head = String::from_utf8_lossy(&head);
        let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
        log.lock().unwrap().push(target.clone());

        let (status, body) = handler(&target, &server_root);
        let response = format!(
          "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          status,
          body.len(),
          body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
      }
    });

    (root, seen)
  }

  fn client(root: &str) -> RapidProClient {
    RapidProClient::new(root, "secret", Duration::from_secs(5)).unwrap()
  }

  fn uuid_params(target: &str) -> Vec<String> {
    target
      .split(['?', '&'])
      .filter_map(|pair| pair.strip_prefix("uuid="))
      .map(str::to_string)
      .collect()
  }

  #[tokio::test]
  async fn test_fetch_follows_next_links() {
    let (root, seen) = serve(|target, root| {
      let page = if target.contains("page=2") {
        json!({"count": 2, "next": null, "results": [{"uuid": "b"}]})
      } else {
        json!({
          "count": 2,
          "next": format!("{}/api/v1/flows.json?page=2", root),
          "results": [{"uuid": "a"}]
        })
      };
      (200, page.to_string())
    })
    .await;

    let filter = Filter {
      after: Some("2016-10-01T00:00:00Z".parse().unwrap()),
      ..Filter::default()
    };
    let flows = client(&root).fetch::<Flow>(&filter).await.unwrap();

    let uuids: Vec<&str> = flows.iter().map(|f| f.uuid.as_str()).collect();
    assert_eq!(uuids, vec!["a", "b"]);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].starts_with("/api/v1/flows.json?after="));
    // The next link already carries the query
    assert_eq!(seen[1], "/api/v1/flows.json?page=2");
  }

  #[tokio::test]
  async fn test_fetch_by_id_sends_chunks() {
    let (root, seen) = serve(|target, _| {
      let results: Vec<_> = uuid_params(target)
        .into_iter()
        .map(|uuid| json!({"uuid": uuid}))
        .collect();
      (200, json!({"next": null, "results": results}).to_string())
    })
    .await;

    let filter = Filter::by_ids((0..150).map(|i| format!("c-{:03}", i)));
    let contacts = client(&root).fetch::<Contact>(&filter).await.unwrap();

    assert_eq!(contacts.len(), 150);
    let per_request: Vec<usize> = seen
      .lock()
      .unwrap()
      .iter()
      .map(|target| uuid_params(target).len())
      .collect();
    assert_eq!(per_request, vec![ID_CHUNK, 50]);
  }

  #[tokio::test]
  async fn test_forbidden_is_authentication_error() {
    let (root, _) = serve(|_, _| (403, json!({"detail": "Invalid token"}).to_string())).await;

    let err = client(&root).fetch::<Run>(&Filter::default()).await.unwrap_err();

    assert!(matches!(
      err.downcast_ref::<RemoteError>(),
      Some(RemoteError::Authentication)
    ));
  }

  #[tokio::test]
  async fn test_server_error_is_not_a_remote_error() {
    let (root, _) = serve(|_, _| (500, "{}".to_string())).await;

    let err = client(&root).fetch::<Run>(&Filter::default()).await.unwrap_err();

    assert!(err.downcast_ref::<RemoteError>().is_none());
  }

  #[test]
  fn test_base_url_adds_https() {
    let url = base_url("rapidpro.io").unwrap();
    assert_eq!(url.as_str(), "https://rapidpro.io/");
  }

  #[test]
  fn test_base_url_keeps_scheme_and_path() {
    let url = base_url("http://localhost:8000/rapidpro/").unwrap();
    assert_eq!(url.as_str(), "http://localhost:8000/rapidpro/");
  }

  #[test]
  fn test_endpoint_urls() {
    let client = RapidProClient::new("localhost:8000", "secret", Duration::from_secs(5)).unwrap();

    assert_eq!(
      client.endpoint(Kind::Run).unwrap().as_str(),
      "https://localhost:8000/api/v1/runs.json"
    );
    assert_eq!(
      client.endpoint(Kind::Contact).unwrap().as_str(),
      "https://localhost:8000/api/v1/contacts.json"
    );
  }

  #[test]
  fn test_auth_failure_statuses() {
    assert!(is_auth_failure(StatusCode::FORBIDDEN));
    assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
    assert!(!is_auth_failure(StatusCode::NOT_FOUND));
    assert!(!is_auth_failure(StatusCode::OK));
  }

  #[test]
  fn test_token_with_newline_is_rejected() {
    assert!(RapidProClient::new("rapidpro.io", "bad\ntoken", Duration::from_secs(5)).is_err());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_connection_error() {
    // Nothing listens on port 9 of the loopback interface
    let client = RapidProClient::new("http://127.0.0.1:9", "secret", Duration::from_secs(5)).unwrap();

    let err = client.fetch::<Flow>(&Filter::default()).await.unwrap_err();

    assert!(matches!(
      err.downcast_ref::<RemoteError>(),
      Some(RemoteError::Connection { .. })
    ));
  }
}
