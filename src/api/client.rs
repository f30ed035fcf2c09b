//! Resilient request layer.
//!
//! Every call goes through [`ApiClient::request`], which:
//! 1. Resolves the endpoint against the base URL (resolved once per client)
//! 2. Injects the bearer token and, for non-GET requests, an idempotency key
//! 3. While offline, serves GETs from cache and queues writes
//! 4. Applies the status policy: 401 logs out, 429 honours Retry-After,
//!    retryable 5xx back off exponentially, other errors surface as-is
//! 5. On network failure, falls back to the last cached GET response or,
//!    for writes while offline, to the action queue

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::{CacheSource, CacheStats, NewQueuedAction, OfflineCache};
use crate::config::{ApiConfig, Config, DEFAULT_API_BASE_URL};
use crate::connectivity::ConnectivityMonitor;
use crate::error::RequestError;
use crate::event::EventBus;

use super::auth::AuthProvider;
use super::retry::{parse_retry_after, RetryPolicy};
use super::transport::{
  HttpRequest, HttpResponse, Method, Transport, TransportError, AUTHORIZATION, CONTENT_TYPE,
  IDEMPOTENCY_KEY, RETRY_AFTER,
};

/// Per-call options for [`ApiClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
  /// Overrides the client's retry budget for this call
  pub max_retries: Option<u32>,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      method: Method::GET,
      headers: BTreeMap::new(),
      body: None,
      max_retries: None,
    }
  }
}

impl RequestOptions {
  pub fn get() -> Self {
    Self::default()
  }

  pub fn post(body: Value) -> Self {
    Self::with_body(Method::POST, body)
  }

  pub fn put(body: Value) -> Self {
    Self::with_body(Method::PUT, body)
  }

  pub fn patch(body: Value) -> Self {
    Self::with_body(Method::PATCH, body)
  }

  pub fn delete() -> Self {
    Self {
      method: Method::DELETE,
      ..Self::default()
    }
  }

  fn with_body(method: Method, body: Value) -> Self {
    Self {
      method,
      body: Some(body),
      ..Self::default()
    }
  }

  pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
  /// Response data and where it came from
  Response { data: Value, source: CacheSource },
  /// The write was stored for replay when connectivity returns
  Queued { action_id: String },
}

impl RequestOutcome {
  pub fn data(&self) -> Option<&Value> {
    match self {
      Self::Response { data, .. } => Some(data),
      Self::Queued { .. } => None,
    }
  }

  pub fn into_data(self) -> Option<Value> {
    match self {
      Self::Response { data, .. } => Some(data),
      Self::Queued { .. } => None,
    }
  }

  pub fn source(&self) -> Option<CacheSource> {
    match self {
      Self::Response { source, .. } => Some(*source),
      Self::Queued { .. } => None,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, Self::Queued { .. })
  }
}

/// One entry of a [`ApiClient::bulk_request`] batch.
#[derive(Debug, Clone)]
pub struct BulkRequest {
  pub endpoint: String,
  pub options: RequestOptions,
}

impl BulkRequest {
  pub fn new(endpoint: impl Into<String>, options: RequestOptions) -> Self {
    Self {
      endpoint: endpoint.into(),
      options,
    }
  }
}

#[derive(Debug)]
pub struct BulkItemResult {
  pub index: usize,
  pub result: Result<RequestOutcome, RequestError>,
}

impl BulkItemResult {
  pub fn success(&self) -> bool {
    self.result.is_ok()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkProgress {
  pub completed: usize,
  pub total: usize,
  pub percentage: u8,
}

pub(super) struct ClientInner {
  pub(super) transport: Arc<dyn Transport>,
  pub(super) auth: Arc<dyn AuthProvider>,
  pub(super) cache: OfflineCache,
  pub(super) connectivity: ConnectivityMonitor,
  pub(super) events: EventBus,
  retry: RetryPolicy,
  configured_base_url: Option<String>,
  base_url: OnceLock<String>,
  offline_ttl: Duration,
  default_timeout: Duration,
  /// Held for the whole of a sync pass so replays never overlap
  pub(super) sync_lock: AsyncMutex<()>,
}

pub struct ApiClientBuilder {
  transport: Arc<dyn Transport>,
  auth: Arc<dyn AuthProvider>,
  cache: OfflineCache,
  connectivity: ConnectivityMonitor,
  events: EventBus,
  config: ApiConfig,
}

impl ApiClientBuilder {
  pub fn cache(mut self, cache: OfflineCache) -> Self {
    self.cache = cache;
    self
  }

  pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn events(mut self, events: EventBus) -> Self {
    self.events = events;
    self
  }

  pub fn config(mut self, config: &ApiConfig) -> Self {
    self.config = config.clone();
    self
  }

  pub fn build(self) -> ApiClient {
    ApiClient {
      inner: Arc::new(ClientInner {
        transport: self.transport,
        auth: self.auth,
        cache: self.cache,
        connectivity: self.connectivity,
        events: self.events,
        retry: RetryPolicy::from_config(&self.config),
        configured_base_url: self.config.base_url.clone(),
        base_url: OnceLock::new(),
        offline_ttl: self.config.offline_ttl(),
        default_timeout: self.config.timeout(),
        sync_lock: AsyncMutex::new(()),
      }),
    }
  }
}

/// HTTP client with retry, idempotency and offline fallback.
#[derive(Clone)]
pub struct ApiClient {
  pub(super) inner: Arc<ClientInner>,
}

impl ApiClient {
  pub fn builder(transport: Arc<dyn Transport>, auth: Arc<dyn AuthProvider>) -> ApiClientBuilder {
    ApiClientBuilder {
      transport,
      auth,
      cache: OfflineCache::disabled(),
      connectivity: ConnectivityMonitor::default(),
      events: EventBus::default(),
      config: ApiConfig::default(),
    }
  }

  pub fn cache(&self) -> &OfflineCache {
    &self.inner.cache
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.inner.connectivity
  }

  pub fn events(&self) -> &EventBus {
    &self.inner.events
  }

  pub fn default_timeout(&self) -> Duration {
    self.inner.default_timeout
  }

  pub fn get_cache_stats(&self) -> CacheStats {
    self
      .inner
      .cache
      .get_cache_stats(self.inner.connectivity.is_online())
  }

  /// Cache key under which the last successful GET of `endpoint` is kept.
  pub fn response_cache_key(endpoint: &str) -> String {
    format!("response:{}", hash_endpoint(endpoint))
  }

  /// Cache key used by [`ApiClient::request_with_cache`].
  pub fn fresh_cache_key(endpoint: &str) -> String {
    format!("fresh:{}", hash_endpoint(endpoint))
  }

  /// Base URL, resolved on first use.
  pub fn base_url(&self) -> &str {
    self
      .inner
      .base_url
      .get_or_init(|| resolve_base_url(self.inner.configured_base_url.as_deref()))
  }

  pub(super) fn build_url(&self, endpoint: &str) -> Result<String, RequestError> {
    let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
      endpoint.to_string()
    } else if endpoint.starts_with('/') {
      format!("{}{}", self.base_url(), endpoint)
    } else {
      format!("{}/{}", self.base_url(), endpoint)
    };

    Url::parse(&url).map_err(|e| RequestError::InvalidRequest(format!("{}: {}", url, e)))?;
    Ok(url)
  }

  /// `headers` plus the bearer token, unless the caller set their own.
  pub(super) fn with_auth(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut headers = headers.clone();
    if !headers.contains_key(AUTHORIZATION) {
      if let Some(token) = self.inner.auth.token() {
        headers.insert(AUTHORIZATION.to_string(), format!("Bearer {}", token));
      }
    }
    headers
  }

  pub(super) async fn session_expired(&self, url: &str) -> RequestError {
    warn!(url, "Session expired, logging out");
    self.inner.auth.logout().await;
    RequestError::AuthExpired
  }

  /// Perform a request with the full resilience policy.
  pub async fn request(
    &self,
    endpoint: &str,
    options: RequestOptions,
  ) -> Result<RequestOutcome, RequestError> {
    let url = self.build_url(endpoint)?;
    let RequestOptions {
      method,
      headers,
      body,
      max_retries,
    } = options;

    let mut headers: BTreeMap<String, String> = headers
      .into_iter()
      .map(|(name, value)| (name.to_ascii_lowercase(), value))
      .collect();
    let caller_idempotency_key = headers.contains_key(IDEMPOTENCY_KEY);
    if method != Method::GET && !caller_idempotency_key {
      headers.insert(IDEMPOTENCY_KEY.to_string(), Uuid::new_v4().to_string());
    }
    if body.is_some() {
      headers
        .entry(CONTENT_TYPE.to_string())
        .or_insert_with(|| "application/json".to_string());
    }

    let cache_key = Self::response_cache_key(endpoint);

    if !self.inner.connectivity.is_online() {
      if method == Method::GET {
        if let Some(data) = self.inner.cache.get_item::<Value>(&cache_key) {
          debug!(endpoint, "Offline, serving cached response");
          return Ok(RequestOutcome::Response {
            data,
            source: CacheSource::Offline,
          });
        }
      } else {
        return self.enqueue(url, &method, headers, body);
      }
    }

    let body_text = body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| RequestError::InvalidRequest(format!("unserializable body: {}", e)))?;
    let max_retries = max_retries.unwrap_or(self.inner.retry.max_retries);
    let server_retry = self
      .inner
      .retry
      .allows_server_retry(&method, caller_idempotency_key);

    let mut attempt: u32 = 0;
    loop {
      let request = HttpRequest {
        method: method.clone(),
        url: url.clone(),
        headers: self.with_auth(&headers),
        body: body_text.clone(),
      };

      let response = match self.inner.transport.send(request).await {
        Ok(response) => response,
        Err(e) => {
          return self.network_fallback(&cache_key, url, &method, headers, body, e);
        }
      };

      match response.status {
        200..=299 => {
          let data = response.data();
          if method == Method::GET {
            self
              .inner
              .cache
              .set_item(&cache_key, &data, Some(self.inner.offline_ttl));
          }
          return Ok(RequestOutcome::Response {
            data,
            source: CacheSource::Network,
          });
        }
        401 => return Err(self.session_expired(&url).await),
        429 => {
          let retry_after = response
            .header(RETRY_AFTER)
            .and_then(|v| parse_retry_after(v, Utc::now()));
          if attempt >= max_retries {
            warn!(url = %url, attempts = attempt + 1, "Rate limit retries exhausted");
            return Err(RequestError::RateLimited {
              attempts: attempt + 1,
              retry_after,
            });
          }
          let delay = retry_after.unwrap_or_else(|| self.inner.retry.backoff(attempt));
          warn!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "Rate limited, retrying");
          tokio::time::sleep(delay).await;
        }
        500..=599 if server_retry && attempt < max_retries => {
          let delay = self.inner.retry.backoff(attempt);
          warn!(
            url = %url,
            status = response.status,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Server error, retrying"
          );
          tokio::time::sleep(delay).await;
        }
        _ => return Err(status_error(&response)),
      }

      attempt += 1;
    }
  }

  /// GET through a ttl cache: served from cache while fresh, stored after a
  /// network hit. Other methods pass straight through to [`ApiClient::request`].
  pub async fn request_with_cache(
    &self,
    endpoint: &str,
    options: RequestOptions,
    ttl: Duration,
  ) -> Result<RequestOutcome, RequestError> {
    if options.method != Method::GET {
      return self.request(endpoint, options).await;
    }

    let key = Self::fresh_cache_key(endpoint);
    if let Some(data) = self.inner.cache.get_item::<Value>(&key) {
      debug!(endpoint, "Cache hit");
      return Ok(RequestOutcome::Response {
        data,
        source: CacheSource::Cache,
      });
    }

    let outcome = self.request(endpoint, options).await?;
    if let RequestOutcome::Response {
      data,
      source: CacheSource::Network,
    } = &outcome
    {
      self.inner.cache.set_item(&key, data, Some(ttl));
    }
    Ok(outcome)
  }

  /// Like [`ApiClient::request`] but gives up after `timeout`, retries included.
  pub async fn request_with_timeout(
    &self,
    endpoint: &str,
    options: RequestOptions,
    timeout: Duration,
  ) -> Result<RequestOutcome, RequestError> {
    match tokio::time::timeout(timeout, self.request(endpoint, options)).await {
      Ok(result) => result,
      Err(_) => {
        warn!(endpoint, timeout_ms = timeout.as_millis() as u64, "Request timed out");
        Err(RequestError::Timeout(timeout))
      }
    }
  }

  /// Like [`ApiClient::request`] but abandoned as soon as `cancel` completes.
  pub async fn request_cancellable<C>(
    &self,
    endpoint: &str,
    options: RequestOptions,
    cancel: C,
  ) -> Result<RequestOutcome, RequestError>
  where
    C: Future<Output = ()>,
  {
    tokio::select! {
      result = self.request(endpoint, options) => result,
      _ = cancel => {
        debug!(endpoint, "Request cancelled");
        Err(RequestError::Cancelled)
      }
    }
  }

  /// Run independent requests one after another. A failure never stops the
  /// batch; `on_progress` is called after each item.
  pub async fn bulk_request<P>(
    &self,
    requests: Vec<BulkRequest>,
    mut on_progress: P,
  ) -> Vec<BulkItemResult>
  where
    P: FnMut(BulkProgress),
  {
    let total = requests.len();
    let mut results = Vec::with_capacity(total);

    for (index, BulkRequest { endpoint, options }) in requests.into_iter().enumerate() {
      let result = self.request(&endpoint, options).await;
      if let Err(e) = &result {
        debug!(index, endpoint = %endpoint, error = %e, "Bulk item failed");
      }
      results.push(BulkItemResult { index, result });

      let completed = index + 1;
      on_progress(BulkProgress {
        completed,
        total,
        percentage: ((completed as f64 / total as f64) * 100.0).round() as u8,
      });
    }

    results
  }

  fn network_fallback(
    &self,
    cache_key: &str,
    url: String,
    method: &Method,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    error: TransportError,
  ) -> Result<RequestOutcome, RequestError> {
    if *method == Method::GET {
      if let Some(data) = self.inner.cache.get_item::<Value>(cache_key) {
        warn!(url = %url, error = %error, "Network unavailable, serving cached response");
        return Ok(RequestOutcome::Response {
          data,
          source: CacheSource::Offline,
        });
      }
    } else if !self.inner.connectivity.is_online() {
      return self.enqueue(url, method, headers, body);
    }

    warn!(url = %url, error = %error, "Network unavailable");
    Err(RequestError::NetworkUnavailable(error.to_string()))
  }

  fn enqueue(
    &self,
    url: String,
    method: &Method,
    mut headers: BTreeMap<String, String>,
    body: Option<Value>,
  ) -> Result<RequestOutcome, RequestError> {
    // Tokens are injected fresh at replay time
    headers.remove(AUTHORIZATION);

    let action = NewQueuedAction {
      url,
      method: method.to_string(),
      headers,
      body,
    };

    match self.inner.cache.queue_action(action) {
      Some(action_id) => {
        info!(action_id = %action_id, method = %method, "Offline, request queued for replay");
        Ok(RequestOutcome::Queued { action_id })
      }
      None => Err(RequestError::NetworkUnavailable(
        "offline and the request could not be queued".to_string(),
      )),
    }
  }
}

fn hash_endpoint(endpoint: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(endpoint.as_bytes());
  hex::encode(hasher.finalize())
}

/// Pick the base URL: configured value, then NEOFORGE_API_URL, then the default.
pub(crate) fn resolve_base_url(configured: Option<&str>) -> String {
  let candidate = configured.map(String::from).or_else(Config::get_api_url);

  let Some(raw) = candidate else {
    return DEFAULT_API_BASE_URL.to_string();
  };

  let trimmed = raw.trim().trim_end_matches('/');
  match Url::parse(trimmed) {
    Ok(url) if matches!(url.scheme(), "http" | "https") => trimmed.to_string(),
    Ok(_) | Err(_) => {
      warn!(base_url = %raw, fallback = DEFAULT_API_BASE_URL, "Invalid API base URL, using default");
      DEFAULT_API_BASE_URL.to_string()
    }
  }
}

/// Map a non-2xx response to an error, pulling a message out of a JSON body.
///
/// 401 never gets here: callers log out first and return `AuthExpired`.
pub(super) fn status_error(response: &HttpResponse) -> RequestError {
  let body: Option<Value> = serde_json::from_str(&response.body).ok();
  let message = body
    .as_ref()
    .and_then(|b| {
      ["detail", "message", "error"]
        .iter()
        .find_map(|field| b.get(*field).and_then(Value::as_str))
    })
    .map(String::from)
    .unwrap_or_else(|| format!("Request failed with status {}", response.status));

  match response.status {
    429 => RequestError::RateLimited {
      attempts: 1,
      retry_after: response
        .header(RETRY_AFTER)
        .and_then(|v| parse_retry_after(v, Utc::now())),
    },
    500..=599 => RequestError::ServerError {
      status: response.status,
      message,
    },
    status => RequestError::ClientError {
      status,
      message,
      body,
    },
  }
}
