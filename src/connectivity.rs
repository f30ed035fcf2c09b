//! Online/offline tracking.
//!
//! The host feeds transitions in through [`ConnectivityMonitor::set_online`]
//! (or a health probe does it, see [`crate::api::ApiClient::spawn_health_probe`]).
//! Listeners watch the flag; the request layer drains its queue on every
//! offline→online edge.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current connectivity. Returns true if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Watch connectivity changes.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Start watching for offline→online transitions from the current state.
  pub fn watch_reconnects(&self) -> ReconnectWatcher {
    let mut rx = self.tx.subscribe();
    rx.borrow_and_update();
    ReconnectWatcher { rx }
  }
}

/// Yields once per offline→online edge seen since it was created.
///
/// The flag only changes on a real transition, so any unseen change that ends
/// online contains a rising edge, even when an offline blip in between was
/// overwritten before this watcher polled.
pub struct ReconnectWatcher {
  rx: watch::Receiver<bool>,
}

impl ReconnectWatcher {
  /// Wait until the next reconnect. Returns `false` once the monitor is gone.
  pub async fn reconnected(&mut self) -> bool {
    loop {
      if self.rx.changed().await.is_err() {
        return false;
      }
      if *self.rx.borrow_and_update() {
        return true;
      }
    }
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_set_online_reports_transitions() {
    let monitor = ConnectivityMonitor::new(true);
    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.is_online());
    assert!(monitor.set_online(true));
    assert!(monitor.is_online());
  }

  #[tokio::test]
  async fn test_reconnected_fires_on_rising_edge() {
    let monitor = ConnectivityMonitor::new(false);
    let mut watcher = monitor.watch_reconnects();

    let waiter = tokio::spawn(async move { watcher.reconnected().await });

    tokio::time::sleep(Duration::from_millis(5)).await;
    monitor.set_online(true);

    assert!(waiter.await.unwrap());
  }

  #[tokio::test]
  async fn test_reconnected_ignores_going_offline() {
    let monitor = ConnectivityMonitor::new(true);
    let mut watcher = monitor.watch_reconnects();

    monitor.set_online(false);
    let result = tokio::time::timeout(Duration::from_millis(20), watcher.reconnected()).await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_watcher_sees_reconnect_after_unpolled_flap() {
    let monitor = ConnectivityMonitor::new(true);
    let mut watcher = monitor.watch_reconnects();

    monitor.set_online(false);
    monitor.set_online(true);

    let fired = tokio::time::timeout(Duration::from_millis(100), watcher.reconnected()).await;
    assert_eq!(fired.ok(), Some(true));
  }

  #[tokio::test]
  async fn test_watcher_sees_edge_before_first_poll() {
    let monitor = ConnectivityMonitor::new(false);
    let mut watcher = monitor.watch_reconnects();

    monitor.set_online(true);

    assert!(watcher.reconnected().await);
  }
}
