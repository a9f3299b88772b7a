use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};

use super::cache::EntityKind;

/// Response header carrying a rotated auth token.
pub const REFRESHED_TOKEN_HEADER: &str = "x-refreshed-token";

/// Raw answer from the remote API.
///
/// Any HTTP status is an `Ok` response at this level; only transport
/// failures are errors. Callers decide what a status means to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
  pub status: u16,
  pub body: Vec<u8>,
  pub renewed_token: Option<String>,
}

impl RemoteResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Turn a non-2xx status into [`SyncError::Rejected`].
  pub fn into_result(self) -> Result<Self> {
    if self.is_success() {
      Ok(self)
    } else {
      Err(SyncError::Rejected {
        status: self.status,
      })
    }
  }
}

/// Per-entity CRUD endpoints of the remote data API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Read the current remote state of `kind`.
  async fn fetch(&self, kind: EntityKind, query: &[(String, String)]) -> Result<RemoteResponse>;

  /// Create or update from a serialized entity.
  async fn create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse>;

  async fn delete(&self, kind: EntityKind, id: &str) -> Result<RemoteResponse>;

  /// Create many entities from a serialized list in one request.
  async fn bulk_create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse>;
}

/// reqwest-backed remote API client
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  token: RwLock<Option<String>>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| SyncError::Config(format!("Invalid base_url {}: {}", config.base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .gzip(true)
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token: RwLock::new(token),
    })
  }

  /// Token that will be sent with the next request.
  pub fn current_token(&self) -> Option<String> {
    self.token.read().ok().and_then(|t| t.clone())
  }

  fn adopt_token(&self, token: &str) {
    if let Ok(mut current) = self.token.write() {
      info!("adopting rotated auth token");
      *current = Some(token.to_string());
    }
  }

  fn endpoint_url(&self, segments: &[&str]) -> Result<Url> {
    endpoint_url(&self.base_url, segments)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match self.current_token() {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder) -> Result<RemoteResponse> {
    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let renewed_token = response
      .headers()
      .get(REFRESHED_TOKEN_HEADER)
      .and_then(|v| v.to_str().ok())
      .filter(|v| !v.is_empty())
      .map(String::from);

    if let Some(token) = &renewed_token {
      self.adopt_token(token);
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?
      .to_vec();

    debug!(status, bytes = body.len(), "remote response");
    Ok(RemoteResponse {
      status,
      body,
      renewed_token,
    })
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn fetch(&self, kind: EntityKind, query: &[(String, String)]) -> Result<RemoteResponse> {
    let url = self.endpoint_url(&[kind.endpoint()])?;
    self.send(self.request(Method::GET, url).query(query)).await
  }

  async fn create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse> {
    let url = self.endpoint_url(&[kind.endpoint()])?;
    let builder = self
      .request(Method::POST, url)
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(body);
    self.send(builder).await
  }

  async fn delete(&self, kind: EntityKind, id: &str) -> Result<RemoteResponse> {
    let url = self.endpoint_url(&[kind.endpoint(), id])?;
    self.send(self.request(Method::DELETE, url)).await
  }

  async fn bulk_create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse> {
    let url = self.endpoint_url(&[kind.endpoint(), "bulk"])?;
    let builder = self
      .request(Method::POST, url)
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(body);
    self.send(builder).await
  }
}

/// Append path segments to `base`, keeping any path prefix it carries.
fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
  let mut url = base.clone();
  url
    .path_segments_mut()
    .map_err(|_| SyncError::Config(format!("base_url cannot be a base: {}", base)))?
    .pop_if_empty()
    .extend(segments);
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_url_keeps_prefix() {
    let base = Url::parse("https://api.example.com/v1").unwrap();
    let url = endpoint_url(&base, &["notes", "abc"]).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/notes/abc");

    let base = Url::parse("https://api.example.com/v1/").unwrap();
    let url = endpoint_url(&base, &["locations", "bulk"]).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/locations/bulk");
  }

  #[test]
  fn test_endpoint_url_escapes_ids() {
    let base = Url::parse("https://api.example.com").unwrap();
    let url = endpoint_url(&base, &["notes", "a/b"]).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/notes/a%2Fb");
  }

  #[test]
  fn test_into_result() {
    let ok = RemoteResponse {
      status: 201,
      body: vec![],
      renewed_token: None,
    };
    assert!(ok.into_result().is_ok());

    let rejected = RemoteResponse {
      status: 400,
      body: vec![],
      renewed_token: None,
    };
    assert!(rejected.into_result().unwrap_err().is_bad_request());
  }

  #[test]
  fn test_new_rejects_bad_url() {
    let config = RemoteConfig {
      base_url: "not a url".into(),
      timeout_secs: 5,
    };
    assert!(matches!(
      HttpRemote::new(&config, None),
      Err(SyncError::Config(_))
    ));
  }

  #[test]
  fn test_token_rotation() {
    let config = RemoteConfig {
      base_url: "https://api.example.com".into(),
      timeout_secs: 5,
    };
    let remote = HttpRemote::new(&config, Some("t1".into())).unwrap();
    assert_eq!(remote.current_token().as_deref(), Some("t1"));

    remote.adopt_token("t2");
    assert_eq!(remote.current_token().as_deref(), Some("t2"));
  }
}
