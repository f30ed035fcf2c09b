//! In-process fakes for exercising the request layer without a network.

use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::OfflineCache;
use crate::config::ApiConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::event::EventBus;

use super::auth::AuthProvider;
use super::client::ApiClient;
use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};

pub const BASE_URL: &str = "http://api.test/api/v1";

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Transport that answers from a closure and records every request it sees.
pub struct FakeTransport {
  handler: Handler,
  delay: Duration,
  requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl FakeTransport {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      handler: Box::new(handler),
      delay: Duration::ZERO,
      requests: Mutex::new(Vec::new()),
    })
  }

  /// Like `new`, but every response takes `delay` to arrive.
  pub fn slow<F>(delay: Duration, handler: F) -> Arc<Self>
  where
    F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      handler: Box::new(handler),
      delay,
      requests: Mutex::new(Vec::new()),
    })
  }

  /// Transport whose every call fails at the network level.
  pub fn unreachable() -> Arc<Self> {
    Self::new(|_| Err(TransportError("connection refused".to_string())))
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .map(|(_, r)| r.clone())
      .collect()
  }

  pub fn request_times(&self) -> Vec<Instant> {
    self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
  }

  pub fn call_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

impl Transport for FakeTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    async move {
      self
        .requests
        .lock()
        .unwrap()
        .push((Instant::now(), request.clone()));
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      (self.handler)(&request)
    }
    .boxed()
  }
}

/// Auth provider with a fixed token that counts logouts.
pub struct FakeAuth {
  pub logouts: AtomicUsize,
}

impl FakeAuth {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      logouts: AtomicUsize::new(0),
    })
  }

  pub fn logout_count(&self) -> usize {
    self.logouts.load(Ordering::SeqCst)
  }
}

impl AuthProvider for FakeAuth {
  fn token(&self) -> Option<String> {
    Some("test-token".to_string())
  }

  fn logout(&self) -> BoxFuture<'_, ()> {
    async move {
      self.logouts.fetch_add(1, Ordering::SeqCst);
    }
    .boxed()
  }
}

pub struct Harness {
  pub client: ApiClient,
  pub transport: Arc<FakeTransport>,
  pub auth: Arc<FakeAuth>,
  pub cache: OfflineCache,
  pub connectivity: ConnectivityMonitor,
  pub events: EventBus,
}

/// Client wired to fakes, an in-memory cache and short backoff delays.
pub fn harness(transport: Arc<FakeTransport>) -> Harness {
  let auth = FakeAuth::new();
  let cache = OfflineCache::in_memory();
  let connectivity = ConnectivityMonitor::new(true);
  let events = EventBus::default();
  let config = ApiConfig {
    base_url: Some(BASE_URL.to_string()),
    base_delay_ms: 100,
    ..ApiConfig::default()
  };

  let client = ApiClient::builder(transport.clone(), auth.clone())
    .cache(cache.clone())
    .connectivity(connectivity.clone())
    .events(events.clone())
    .config(&config)
    .build();

  Harness {
    client,
    transport,
    auth,
    cache,
    connectivity,
    events,
  }
}
