//! Resilient request layer.
//!
//! Everything the frontend sends to the backend goes through [`ApiClient`]:
//! - Bearer token and idempotency key injection
//! - Exponential backoff for 5xx, `Retry-After` for 429, logout on 401
//! - Cached GET responses as a fallback when the network is down
//! - Offline writes queued in the [`crate::cache::OfflineCache`] and replayed
//!   on reconnect

mod auth;
mod client;
mod retry;
mod sync;
#[cfg(test)]
mod testing;
mod transport;

pub use auth::{AuthProvider, EnvTokenAuth, NoAuth};
pub use client::{
  ApiClient, ApiClientBuilder, BulkItemResult, BulkProgress, BulkRequest, RequestOptions,
  RequestOutcome,
};
pub use retry::{parse_retry_after, RetryPolicy};
pub use sync::SyncReport;
pub use transport::{
  HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError,
};
