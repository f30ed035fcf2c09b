//! Replay of queued offline writes.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::QueuedAction;
use crate::error::{ErrorKind, RequestError};
use crate::event::Event;

use super::client::{status_error, ApiClient};
use super::transport::{HttpRequest, Method};

/// Outcome of one pass over the offline queue.
#[derive(Debug, Default)]
pub struct SyncReport {
  /// Ids replayed successfully and removed from the queue
  pub synced: Vec<String>,
  /// Ids that failed this pass and remain queued
  pub failed: Vec<(String, RequestError)>,
}

impl SyncReport {
  pub fn is_empty(&self) -> bool {
    self.synced.is_empty() && self.failed.is_empty()
  }
}

impl ApiClient {
  /// Replay every queued action once, oldest first.
  ///
  /// Does nothing while offline. Successful actions are removed; failed ones
  /// stay queued for the next pass. A 401 ends the pass early. Passes never
  /// overlap.
  pub async fn sync_pending_actions(&self) -> SyncReport {
    let mut report = SyncReport::default();

    if !self.inner.connectivity.is_online() {
      debug!("Offline, skipping queue sync");
      return report;
    }

    let _guard = self.inner.sync_lock.lock().await;

    let pending = self.inner.cache.get_pending_actions();
    if pending.is_empty() {
      return report;
    }
    info!(count = pending.len(), "Syncing offline actions");

    for action in pending {
      match self.replay(&action).await {
        Ok(()) => {
          self.inner.cache.remove_completed_action(&action.id);
          self.inner.events.emit(Event::OfflineActionSynced {
            id: action.id.clone(),
            url: action.url.clone(),
            method: action.method.clone(),
          });
          report.synced.push(action.id);
        }
        Err(e) => {
          warn!(
            kind = ?ErrorKind::QueueReplayFailure,
            id = %action.id,
            url = %action.url,
            error = %e,
            "Offline action replay failed, keeping it queued"
          );
          let auth_expired = e.kind() == ErrorKind::AuthExpired;
          report.failed.push((action.id, e));
          if auth_expired {
            // The session is gone; the rest waits for the next login and trigger
            warn!("Session expired during sync, stopping this pass");
            break;
          }
        }
      }
    }

    info!(
      synced = report.synced.len(),
      failed = report.failed.len(),
      "Offline sync finished"
    );
    report
  }

  /// One attempt at a queued action, with the current token.
  async fn replay(&self, action: &QueuedAction) -> Result<(), RequestError> {
    let method = Method::from_bytes(action.method.as_bytes())
      .map_err(|_| RequestError::InvalidRequest(format!("unknown method {}", action.method)))?;
    let body = action
      .body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| RequestError::InvalidRequest(format!("unserializable body: {}", e)))?;

    let request = HttpRequest {
      method,
      url: action.url.clone(),
      headers: self.with_auth(&action.headers),
      body,
    };

    let response = self
      .inner
      .transport
      .send(request)
      .await
      .map_err(|e| RequestError::NetworkUnavailable(e.to_string()))?;

    match response.status {
      200..=299 => Ok(()),
      401 => Err(self.session_expired(&action.url).await),
      _ => Err(status_error(&response)),
    }
  }

  /// Drain the queue on every offline→online transition.
  pub fn spawn_reconnect_sync(&self) -> JoinHandle<()> {
    let client = self.clone();
    let mut watcher = self.inner.connectivity.watch_reconnects();

    tokio::spawn(async move {
      while watcher.reconnected().await {
        client.sync_pending_actions().await;
      }
    })
  }

  /// Check the `/health` endpoint once and feed the result to the monitor.
  ///
  /// Only a network-level failure counts as offline; any HTTP answer means the
  /// server is reachable.
  pub async fn probe_health(&self) -> bool {
    let Ok(url) = self.build_url("/health") else {
      return self.inner.connectivity.is_online();
    };

    let request = HttpRequest {
      method: Method::GET,
      url,
      headers: Default::default(),
      body: None,
    };

    let probe = self.inner.transport.send(request);
    let reachable = match tokio::time::timeout(self.default_timeout(), probe).await {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        debug!(error = %e, "Health probe failed");
        false
      }
      Err(_) => {
        debug!("Health probe timed out");
        false
      }
    };

    self.inner.connectivity.set_online(reachable);
    reachable
  }

  /// Probe `/health` every `interval` until the task is aborted.
  pub fn spawn_health_probe(&self, interval: Duration) -> JoinHandle<()> {
    let client = self.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        client.probe_health().await;
      }
    })
  }
}
