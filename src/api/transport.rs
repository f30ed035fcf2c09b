//! HTTP seam between the request layer and the network.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub use reqwest::Method;

pub const AUTHORIZATION: &str = "authorization";
pub const CONTENT_TYPE: &str = "content-type";
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const RETRY_AFTER: &str = "retry-after";

/// A fully resolved outgoing request. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl HttpRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }
}

/// A received response, whatever its status. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: String,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, body: &Value) -> Self {
    Self::new(status, body.to_string()).with_header(CONTENT_TYPE, "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Decode the body: JSON when labelled as such, otherwise text.
  /// An empty body is `null`.
  pub fn data(&self) -> Value {
    if self.body.trim().is_empty() {
      return Value::Null;
    }

    let is_json = self
      .header(CONTENT_TYPE)
      .map(|ct| ct.contains("json"))
      .unwrap_or(false);

    if is_json {
      serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    } else {
      Value::String(self.body.clone())
    }
  }
}

/// Network-level failure: no HTTP response was received at all.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends one request, once. Retries and fallbacks live above this seam.
pub trait Transport: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("neoforge-client/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let mut builder = self.client.request(request.method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response
      .text()
      .await
      .map_err(|e| TransportError(e.to_string()))?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

impl Transport for ReqwestTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    self.execute(request).boxed()
  }
}
