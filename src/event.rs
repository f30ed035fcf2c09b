use serde_json::Value;
use tokio::sync::broadcast;

/// Process-wide notifications for telemetry and dashboards
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// The state tree was replaced; `action` is `None` for replace/reset/hydrate
  StateChanged { action: Option<String> },
  /// A dispatch changed state
  ActionDispatched { action_type: String, payload: Value },
  /// A queued offline action was replayed successfully and removed
  OfflineActionSynced {
    id: String,
    url: String,
    method: String,
  },
}

impl Event {
  /// Wire name of the event
  pub fn name(&self) -> &'static str {
    match self {
      Event::StateChanged { .. } => "state-changed",
      Event::ActionDispatched { .. } => "action-dispatched",
      Event::OfflineActionSynced { .. } => "offline-action-synced",
    }
  }
}

/// Broadcast bus for [`Event`]s. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<Event>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Send an event to all current listeners
  pub fn emit(&self, event: Event) {
    // No listeners is fine
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}
