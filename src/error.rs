//! Error taxonomy for the request layer and the state store.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Discriminant for every failure the core can report or log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// 401 from the server, session was invalidated
  AuthExpired,
  /// 429 and the retry budget ran out
  RateLimited,
  /// 5xx that could not (or may not) be retried away
  ServerError,
  /// Any other non-2xx status
  ClientError,
  /// Transport-level failure with no cache or queue remedy
  NetworkUnavailable,
  Timeout,
  Cancelled,
  /// Persistence backend missing or failing; logged, never returned
  CacheUnavailable,
  /// A queued action failed its replay attempt; it stays queued
  QueueReplayFailure,
  InvalidRequest,
}

/// Errors surfaced by [`crate::api::ApiClient`].
#[derive(Debug, Error)]
pub enum RequestError {
  #[error("session expired, please log in again")]
  AuthExpired,

  #[error("rate limited after {attempts} attempts")]
  RateLimited {
    attempts: u32,
    retry_after: Option<Duration>,
  },

  #[error("server error {status}: {message}")]
  ServerError { status: u16, message: String },

  #[error("request failed with status {status}: {message}")]
  ClientError {
    status: u16,
    message: String,
    body: Option<Value>,
  },

  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("request cancelled")]
  Cancelled,

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl RequestError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::AuthExpired => ErrorKind::AuthExpired,
      Self::RateLimited { .. } => ErrorKind::RateLimited,
      Self::ServerError { .. } => ErrorKind::ServerError,
      Self::ClientError { .. } => ErrorKind::ClientError,
      Self::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
      Self::Timeout(_) => ErrorKind::Timeout,
      Self::Cancelled => ErrorKind::Cancelled,
      Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
    }
  }

  /// HTTP status behind the error, if one was received.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::AuthExpired => Some(401),
      Self::RateLimited { .. } => Some(429),
      Self::ServerError { status, .. } | Self::ClientError { status, .. } => Some(*status),
      _ => None,
    }
  }
}

/// Errors surfaced by [`crate::store::Store::dispatch`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
  #[error("reducer for '{action}' failed: {message}")]
  Reducer { action: String, message: String },
}
