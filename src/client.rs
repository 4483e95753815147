//! REST transport shared by every resource domain.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cancel::CancelSignal;
use crate::credentials::CredentialProvider;
use crate::error::SyncError;

/// Authenticated JSON-over-HTTP client for the compliance API.
///
/// Every call takes a [`CancelSignal`]; once it fires the request is dropped
/// and the call resolves to [`SyncError::Cancelled`].
#[derive(Clone)]
pub struct ResourceClient {
  http: reqwest::Client,
  base_url: Url,
  credentials: Arc<dyn CredentialProvider>,
}

impl ResourceClient {
  pub fn new(
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
  ) -> Result<Self, SyncError> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("casesync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| SyncError::transport(None, format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base_url: with_trailing_slash(base_url),
      credentials,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &[&str],
    query: &[(String, String)],
    signal: &CancelSignal,
  ) -> Result<T, SyncError> {
    self.send(Method::GET, path, query, None, signal).await
  }

  pub async fn post<B: Serialize, T: DeserializeOwned>(
    &self,
    path: &[&str],
    body: &B,
    signal: &CancelSignal,
  ) -> Result<T, SyncError> {
    let body = serde_json::to_vec(body)?;
    self.send(Method::POST, path, &[], Some(body), signal).await
  }

  pub async fn patch<B: Serialize, T: DeserializeOwned>(
    &self,
    path: &[&str],
    body: &B,
    signal: &CancelSignal,
  ) -> Result<T, SyncError> {
    let body = serde_json::to_vec(body)?;
    self.send(Method::PATCH, path, &[], Some(body), signal).await
  }

  async fn send<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &[&str],
    query: &[(String, String)],
    body: Option<Vec<u8>>,
    signal: &CancelSignal,
  ) -> Result<T, SyncError> {
    let url = self.endpoint(path)?;

    signal
      .run(async {
        let token = self.credentials.token().await?;
        debug!(method = %method, url = %url, "request");

        let mut request = self
          .http
          .request(method, url)
          .bearer_auth(token)
          .header(ACCEPT, "application/json");
        if !query.is_empty() {
          request = request.query(query);
        }
        if let Some(body) = body {
          request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
          return Err(SyncError::transport(
            Some(status.as_u16()),
            error_message(&bytes, status.canonical_reason()),
          ));
        }
        decode(&bytes)
      })
      .await
  }
}

impl ResourceClient {
  /// Append `segments` to the base URL, escaping each one.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| SyncError::transport(None, format!("base URL '{}' cannot take a path", self.base_url)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }
}

fn with_trailing_slash(mut url: Url) -> Url {
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  url
}

/// Parse a success body. An empty body reads as JSON `null`.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Ok(serde_json::from_value(Value::Null)?);
  }
  Ok(serde_json::from_slice(bytes)?)
}

/// Best-effort human message from an error body.
fn error_message(bytes: &[u8], reason: Option<&str>) -> String {
  if let Ok(body) = serde_json::from_slice::<Value>(bytes) {
    for field in ["message", "error", "detail"] {
      if let Some(message) = body.get(field).and_then(Value::as_str) {
        return message.to_string();
      }
    }
  }
  let text = String::from_utf8_lossy(bytes);
  let text = text.trim();
  if text.is_empty() {
    return reason.unwrap_or("request failed").to_string();
  }
  text.chars().take(200).collect()
}
