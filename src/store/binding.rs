//! Composition-based binding of a consumer to a store slice.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::state::{Store, SubscribeOptions, Subscription};

/// A live view of one store slice.
///
/// Holds the latest selected value and lets the owner either poll for changes
/// from a render loop or await them.
pub struct StoreBinding {
  rx: watch::Receiver<Value>,
  subscription: Subscription,
}

/// Bind to the slice picked out by `selector`.
pub fn bind<F>(store: &Store, selector: F) -> StoreBinding
where
  F: Fn(&Value) -> Value + Send + Sync + 'static,
{
  let selector = Arc::new(selector);
  let (tx, rx) = watch::channel(Value::Null);
  let tx = Arc::new(tx);
  let notified = Arc::new(AtomicBool::new(false));

  let sender = Arc::clone(&tx);
  let flag = Arc::clone(&notified);
  let select = Arc::clone(&selector);
  let subscription = store.subscribe(
    move |value, _| {
      sender.send_modify(|current| {
        flag.store(true, Ordering::SeqCst);
        *current = value.clone();
      });
    },
    SubscribeOptions::new().selector(move |state| select(state)),
  );

  // Seed under the channel lock: a notification either landed first and wins,
  // or waits behind the seed and overwrites it. Seeding is not a change.
  tx.send_if_modified(|current| {
    if !notified.load(Ordering::SeqCst) {
      *current = store.select(|state| selector(state));
    }
    false
  });

  StoreBinding { rx, subscription }
}

impl StoreBinding {
  /// Latest selected value.
  pub fn get(&self) -> Value {
    self.rx.borrow().clone()
  }

  /// Returns `true` if the slice changed since the last poll.
  pub fn poll(&mut self) -> bool {
    match self.rx.has_changed() {
      Ok(true) => {
        self.rx.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change. Returns `false` once the binding can no longer change.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }

  pub fn unbind(self) {
    self.subscription.unsubscribe();
  }
}
