//! Token source and logout hook consumed by the request layer.

use futures::future::{BoxFuture, FutureExt};
use std::sync::{PoisonError, RwLock};
use tracing::warn;

use crate::config::Config;

pub trait AuthProvider: Send + Sync {
  /// Current bearer token, if logged in.
  fn token(&self) -> Option<String>;

  /// Invalidate the session. Called when the server answers 401.
  fn logout(&self) -> BoxFuture<'_, ()>;
}

/// Anonymous access.
pub struct NoAuth;

impl AuthProvider for NoAuth {
  fn token(&self) -> Option<String> {
    None
  }

  fn logout(&self) -> BoxFuture<'_, ()> {
    async {}.boxed()
  }
}

/// Token read from NEOFORGE_TOKEN at startup; dropped on logout.
pub struct EnvTokenAuth {
  token: RwLock<Option<String>>,
}

impl EnvTokenAuth {
  pub fn from_env() -> Self {
    Self::new(Config::get_api_token())
  }

  pub fn new(token: Option<String>) -> Self {
    Self {
      token: RwLock::new(token),
    }
  }
}

impl AuthProvider for EnvTokenAuth {
  fn token(&self) -> Option<String> {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn logout(&self) -> BoxFuture<'_, ()> {
    async move {
      let had_token = self
        .token
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .is_some();
      if had_token {
        warn!("Session expired, token discarded. Set NEOFORGE_TOKEN to log in again.");
      }
    }
    .boxed()
  }
}
