//! Dispatch/reducer/middleware/subscriber pipeline over an immutable state tree.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use tracing::{debug, error, warn};

use crate::cache::OfflineCache;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::event::{Event, EventBus};

/// `(state, payload) -> next state`. May be async but should not do I/O.
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// `(action, state, store) -> action`; `None` cancels the dispatch.
pub type MiddlewareFn =
  Arc<dyn Fn(Action, Arc<Value>, Store) -> BoxFuture<'static, Option<Action>> + Send + Sync>;

/// Observes reducer failures before they propagate to the dispatcher.
pub type ErrorMiddlewareFn = Arc<dyn Fn(&Action, &StoreError) + Send + Sync>;

pub type SelectorFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// `(new, previous)` selected values.
pub type SubscriberFn = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Wrap a synchronous reducer.
pub fn reducer<F>(f: F) -> ReducerFn
where
  F: Fn(Value, Value) -> Result<Value> + Send + Sync + 'static,
{
  Arc::new(move |state, payload| {
    let next = f(state, payload);
    async move { next }.boxed()
  })
}

/// Wrap an async reducer.
pub fn async_reducer<F, Fut>(f: F) -> ReducerFn
where
  F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  Arc::new(move |state, payload| f(state, payload).boxed())
}

pub fn middleware<F, Fut>(f: F) -> MiddlewareFn
where
  F: Fn(Action, Arc<Value>, Store) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Option<Action>> + Send + 'static,
{
  Arc::new(move |action, state, store| f(action, state, store).boxed())
}

/// Middleware that traces every action passing through.
pub fn logging_middleware() -> MiddlewareFn {
  middleware(|action: Action, _state, _store| async move {
    debug!(action = %action.action_type, payload = %action.payload, "Dispatching");
    Some(action)
  })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
  pub action_type: String,
  pub payload: Value,
}

impl Action {
  pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
    Self {
      action_type: action_type.into(),
      payload,
    }
  }
}

impl From<&str> for Action {
  fn from(action_type: &str) -> Self {
    Self::new(action_type, Value::Null)
  }
}

impl From<String> for Action {
  fn from(action_type: String) -> Self {
    Self::new(action_type, Value::Null)
  }
}

impl From<(&str, Value)> for Action {
  fn from((action_type, payload): (&str, Value)) -> Self {
    Self::new(action_type, payload)
  }
}

/// Options for [`Store::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
  selector: Option<SelectorFn>,
  immediate: bool,
}

impl SubscribeOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Only notify when this slice of the state changes.
  pub fn selector<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
  {
    self.selector = Some(Arc::new(f));
    self
  }

  /// Invoke the callback once right away with the current value.
  pub fn immediate(mut self) -> Self {
    self.immediate = true;
    self
  }
}

struct Subscriber {
  id: u64,
  callback: SubscriberFn,
  selector: Option<SelectorFn>,
}

impl Subscriber {
  fn select(&self, state: &Value) -> Value {
    match &self.selector {
      Some(selector) => selector(state),
      None => state.clone(),
    }
  }
}

/// Handle returned by [`Store::subscribe`].
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe() to remove it"]
pub struct Subscription {
  store: Weak<StoreInner>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {
    if let Some(inner) = self.store.upgrade() {
      lock(&inner.subscribers).retain(|s| s.id != self.id);
    }
  }
}

struct Persistence {
  cache: OfflineCache,
  keys: Vec<String>,
  cache_key: String,
}

struct StoreInner {
  state: RwLock<Arc<Value>>,
  reducers: RwLock<HashMap<String, ReducerFn>>,
  middleware: RwLock<Vec<MiddlewareFn>>,
  error_middleware: RwLock<Vec<ErrorMiddlewareFn>>,
  subscribers: Mutex<Vec<Arc<Subscriber>>>,
  next_subscriber_id: AtomicU64,
  persistence: Option<Persistence>,
  events: Option<EventBus>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StoreBuilder {
  initial: Value,
  persistence: Option<Persistence>,
  events: Option<EventBus>,
}

impl StoreBuilder {
  /// Persist the whitelisted root slices into `cache` after every change.
  pub fn persistence(mut self, cache: OfflineCache, config: &StoreConfig) -> Self {
    self.persistence = Some(Persistence {
      cache,
      keys: config.persist_keys.clone(),
      cache_key: config.persist_key.clone(),
    });
    self
  }

  pub fn events(mut self, events: EventBus) -> Self {
    self.events = Some(events);
    self
  }

  pub fn build(self) -> Store {
    Store {
      inner: Arc::new(StoreInner {
        state: RwLock::new(Arc::new(self.initial)),
        reducers: RwLock::new(HashMap::new()),
        middleware: RwLock::new(Vec::new()),
        error_middleware: RwLock::new(Vec::new()),
        subscribers: Mutex::new(Vec::new()),
        next_subscriber_id: AtomicU64::new(1),
        persistence: self.persistence,
        events: self.events,
      }),
    }
  }
}

/// Canonical in-memory application state.
///
/// The state tree is only ever replaced, never mutated: every snapshot handed
/// out is an `Arc<Value>` that no other party can write through.
///
/// Dispatches are not serialized end to end. Two dispatches whose middleware or
/// reducers await may interleave, and whichever finishes last wins. Callers that
/// need ordering must await one dispatch before issuing the next.
#[derive(Clone)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  pub fn new(initial: Value) -> Self {
    Self::builder(initial).build()
  }

  pub fn builder(initial: Value) -> StoreBuilder {
    StoreBuilder {
      initial,
      persistence: None,
      events: None,
    }
  }

  /// Register reducers by action type.
  pub fn add_actions<I, K>(&self, actions: I)
  where
    I: IntoIterator<Item = (K, ReducerFn)>,
    K: Into<String>,
  {
    let mut reducers = self
      .inner
      .reducers
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    for (action_type, reducer) in actions {
      let action_type = action_type.into();
      if reducers.insert(action_type.clone(), reducer).is_some() {
        warn!(action = %action_type, "Reducer registered twice, keeping the latest");
      }
    }
  }

  /// Append to the middleware chain. Middleware runs in registration order.
  pub fn add_middleware(&self, middleware: MiddlewareFn) {
    self
      .inner
      .middleware
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(middleware);
  }

  pub fn add_error_middleware<F>(&self, f: F)
  where
    F: Fn(&Action, &StoreError) + Send + Sync + 'static,
  {
    self
      .inner
      .error_middleware
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Arc::new(f));
  }

  /// Current state snapshot.
  pub fn get_state(&self) -> Arc<Value> {
    Arc::clone(&read(&self.inner.state))
  }

  pub fn select<T>(&self, selector: impl FnOnce(&Value) -> T) -> T {
    selector(&self.get_state())
  }

  /// Run `action` through middleware and its reducer.
  ///
  /// Unknown action types are logged and ignored. A reducer's own error is
  /// handed to the error middleware and then returned.
  pub async fn dispatch(&self, action: impl Into<Action>) -> Result<(), StoreError> {
    let mut action = action.into();

    let chain: Vec<MiddlewareFn> = read(&self.inner.middleware).clone();
    for middleware in chain {
      let action_type = action.action_type.clone();
      match middleware(action, self.get_state(), self.clone()).await {
        Some(next) => action = next,
        None => {
          debug!(action = %action_type, "Dispatch cancelled by middleware");
          return Ok(());
        }
      }
    }

    let reducer = read(&self.inner.reducers)
      .get(&action.action_type)
      .cloned();
    let Some(reducer) = reducer else {
      warn!(action = %action.action_type, "No reducer for action, ignoring");
      return Ok(());
    };

    let base = self.get_state();
    let next = match reducer(Value::clone(&base), action.payload.clone()).await {
      Ok(next) => next,
      Err(e) => {
        let err = StoreError::Reducer {
          action: action.action_type.clone(),
          message: format!("{:#}", e),
        };
        let hooks: Vec<ErrorMiddlewareFn> = read(&self.inner.error_middleware).clone();
        for hook in hooks {
          hook(&action, &err);
        }
        error!(action = %action.action_type, error = %err, "Reducer failed");
        return Err(err);
      }
    };

    if next == *base {
      debug!(action = %action.action_type, "State unchanged");
      return Ok(());
    }

    let (previous, current) = self.swap(next);
    self.notify(&previous, &current, false);
    self.persist(&previous, &current, false);

    if let Some(events) = &self.inner.events {
      events.emit(Event::StateChanged {
        action: Some(action.action_type.clone()),
      });
      events.emit(Event::ActionDispatched {
        action_type: action.action_type,
        payload: action.payload,
      });
    }

    Ok(())
  }

  /// Atomically replace the whole state. Always notifies every subscriber.
  pub fn replace_state(&self, state: Value) {
    let (previous, current) = self.swap(state);
    self.notify(&previous, &current, true);
    self.persist(&previous, &current, true);

    if let Some(events) = &self.inner.events {
      events.emit(Event::StateChanged { action: None });
    }
  }

  pub fn reset(&self, initial: Value) {
    self.replace_state(initial);
  }

  /// Merge persisted slices from the cache into the current state.
  ///
  /// Returns `true` if anything was restored.
  pub fn hydrate(&self) -> bool {
    let Some(persistence) = &self.inner.persistence else {
      return false;
    };
    let Some(saved) = persistence
      .cache
      .get_item::<Map<String, Value>>(&persistence.cache_key)
    else {
      return false;
    };

    let mut state = match Value::clone(&self.get_state()) {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    let mut restored = false;
    for key in &persistence.keys {
      if let Some(value) = saved.get(key) {
        state.insert(key.clone(), value.clone());
        restored = true;
      }
    }

    if restored {
      debug!(key = %persistence.cache_key, "Hydrated persisted state");
      self.replace_state(Value::Object(state));
    }
    restored
  }

  /// Register a callback. It fires when its selected slice (or the whole
  /// state, without a selector) changes by deep inequality.
  pub fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Subscription
  where
    F: Fn(&Value, &Value) + Send + Sync + 'static,
  {
    let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    let subscriber = Arc::new(Subscriber {
      id,
      callback: Arc::new(callback),
      selector: options.selector,
    });

    // Register before reading so no change can slip between the two
    lock(&self.inner.subscribers).push(Arc::clone(&subscriber));

    if options.immediate {
      let current = subscriber.select(&self.get_state());
      (subscriber.callback)(&current, &Value::Null);
    }

    Subscription {
      store: Arc::downgrade(&self.inner),
      id,
    }
  }

  fn swap(&self, next: Value) -> (Arc<Value>, Arc<Value>) {
    let current = Arc::new(next);
    let mut state = self
      .inner
      .state
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    let previous = std::mem::replace(&mut *state, Arc::clone(&current));
    (previous, current)
  }

  fn notify(&self, previous: &Value, current: &Value, force: bool) {
    // Callbacks may subscribe or unsubscribe, so never hold the lock while calling out
    let subscribers: Vec<Arc<Subscriber>> = lock(&self.inner.subscribers).clone();

    for subscriber in subscribers {
      let before = subscriber.select(previous);
      let after = subscriber.select(current);
      if force || before != after {
        (subscriber.callback)(&after, &before);
      }
    }
  }

  fn persist(&self, previous: &Value, current: &Value, force: bool) {
    let Some(persistence) = &self.inner.persistence else {
      return;
    };
    if persistence.keys.is_empty() {
      return;
    }

    let touched = force
      || persistence
        .keys
        .iter()
        .any(|key| previous.get(key) != current.get(key));
    if !touched {
      return;
    }

    let subset: Map<String, Value> = persistence
      .keys
      .iter()
      .filter_map(|key| current.get(key).map(|v| (key.clone(), v.clone())))
      .collect();

    persistence
      .cache
      .set_item(&persistence.cache_key, &subset, None);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn app_state() -> Value {
    json!({
      "theme": "light",
      "notifications": [],
      "user": { "name": "ada" }
    })
  }

  fn app_store() -> Store {
    let store = Store::new(app_state());
    store.add_actions([
      (
        "setTheme",
        reducer(|mut state, payload| {
          state["theme"] = payload;
          Ok(state)
        }),
      ),
      (
        "notify",
        reducer(|mut state, payload| {
          if let Some(list) = state["notifications"].as_array_mut() {
            list.push(payload);
          }
          Ok(state)
        }),
      ),
      ("noop", reducer(|state, _| Ok(state))),
    ]);
    store
  }

  fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value, &Value) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move |_: &Value, _: &Value| {
      c.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[tokio::test]
  async fn test_noop_dispatch_skips_notification_and_persistence() {
    let cache = OfflineCache::in_memory();
    let config = StoreConfig {
      persist_keys: vec!["theme".to_string()],
      ..StoreConfig::default()
    };
    let store = Store::builder(app_state())
      .persistence(cache.clone(), &config)
      .build();
    store.add_actions([("noop", reducer(|state, _| Ok(state)))]);

    let (count, callback) = counter();
    let _sub = store.subscribe(callback, SubscribeOptions::new());
    let before = store.get_state();

    store.dispatch("noop").await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(Arc::ptr_eq(&before, &store.get_state()));
    assert_eq!(cache.get_item::<Value>("app_state"), None);
  }

  #[tokio::test]
  async fn test_previous_snapshot_never_changes() {
    let store = app_store();
    let before = store.get_state();

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();

    assert_eq!(before["theme"], "light");
    assert_eq!(store.select(|s| s["theme"].clone()), "dark");

    // Writing through a snapshot clones it; the store is unaffected
    let mut local = store.get_state();
    Arc::make_mut(&mut local)["theme"] = json!("hacked");
    assert_eq!(store.select(|s| s["theme"].clone()), "dark");
  }

  #[tokio::test]
  async fn test_selector_scoped_subscription() {
    let store = app_store();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = store.subscribe(
      move |theme, _| s.lock().unwrap().push(theme.clone()),
      SubscribeOptions::new().selector(|state| state["theme"].clone()),
    );

    store
      .dispatch(("notify", json!({ "msg": "hi" })))
      .await
      .unwrap();
    assert!(seen.lock().unwrap().is_empty());

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!("dark")]);
  }

  #[tokio::test]
  async fn test_unknown_action_is_a_noop() {
    let store = app_store();
    let before = store.get_state();

    store.dispatch("doesNotExist").await.unwrap();

    assert!(Arc::ptr_eq(&before, &store.get_state()));
  }

  #[tokio::test]
  async fn test_middleware_runs_in_order_and_can_rewrite() {
    let store = app_store();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    store.add_middleware(middleware(move |action: Action, _state, _store| {
      o.lock().unwrap().push("first");
      async move { Some(Action::new(action.action_type, json!("dark"))) }
    }));
    let o = order.clone();
    store.add_middleware(middleware(move |action, _state, _store| {
      o.lock().unwrap().push("second");
      async move { Some(action) }
    }));

    store
      .dispatch(("setTheme", json!("light-ish")))
      .await
      .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(store.select(|s| s["theme"].clone()), "dark");
  }

  #[tokio::test]
  async fn test_middleware_can_cancel() {
    let store = app_store();
    store.add_middleware(middleware(|action: Action, _state, _store| async move {
      if action.action_type == "setTheme" {
        None
      } else {
        Some(action)
      }
    }));

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();

    assert_eq!(store.select(|s| s["theme"].clone()), "light");
  }

  #[tokio::test]
  async fn test_reducer_error_reaches_error_middleware_and_caller() {
    let store = app_store();
    store.add_actions([("explode", reducer(|_, _| Err(eyre!("boom"))))]);

    let recorded = Arc::new(Mutex::new(Vec::new()));
    let r = recorded.clone();
    store.add_error_middleware(move |action, err| {
      r.lock().unwrap().push((action.action_type.clone(), err.to_string()));
    });

    let err = store.dispatch("explode").await.unwrap_err();

    assert!(matches!(err, StoreError::Reducer { ref action, .. } if action == "explode"));
    assert_eq!(recorded.lock().unwrap().len(), 1);
    assert_eq!(*store.get_state(), app_state());
  }

  #[tokio::test]
  async fn test_replace_state_always_notifies() {
    let store = app_store();
    let (count, callback) = counter();
    let _sub = store.subscribe(
      callback,
      SubscribeOptions::new().selector(|s| s["theme"].clone()),
    );

    store.replace_state(app_state());
    store.reset(app_state());

    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_immediate_and_unsubscribe() {
    let store = app_store();
    let (count, callback) = counter();
    let sub = store.subscribe(callback, SubscribeOptions::new().immediate());
    assert_eq!(count.load(Ordering::SeqCst), 1);

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    sub.unsubscribe();
    store
      .dispatch(("setTheme", json!("light")))
      .await
      .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_immediate_subscriber_sees_changes_made_during_first_call() {
    let store = app_store();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    let writer = store.clone();
    let _sub = store.subscribe(
      move |theme, _| {
        let first = {
          let mut seen = s.lock().unwrap();
          seen.push(theme.clone());
          seen.len() == 1
        };
        if first {
          let mut next = Value::clone(&writer.get_state());
          next["theme"] = json!("dark");
          writer.replace_state(next);
        }
      },
      SubscribeOptions::new()
        .selector(|state| state["theme"].clone())
        .immediate(),
    );

    assert_eq!(*seen.lock().unwrap(), vec![json!("light"), json!("dark")]);
  }

  #[tokio::test]
  async fn test_concurrent_async_dispatches_last_completion_wins() {
    let store = Store::new(json!({ "value": 0 }));
    store.add_actions([
      (
        "slow",
        async_reducer(|mut state, _| async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          state["value"] = json!("slow");
          Ok(state)
        }),
      ),
      (
        "fast",
        reducer(|mut state, _| {
          state["value"] = json!("fast");
          Ok(state)
        }),
      ),
    ]);

    let slow = {
      let store = store.clone();
      tokio::spawn(async move { store.dispatch("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.dispatch("fast").await.unwrap();
    assert_eq!(store.select(|s| s["value"].clone()), "fast");

    slow.await.unwrap().unwrap();
    assert_eq!(store.select(|s| s["value"].clone()), "slow");
  }

  #[tokio::test]
  async fn test_whitelisted_slices_persist_and_hydrate() {
    let cache = OfflineCache::in_memory();
    let config = StoreConfig {
      persist_keys: vec!["theme".to_string()],
      ..StoreConfig::default()
    };
    let store = Store::builder(app_state())
      .persistence(cache.clone(), &config)
      .build();
    store.add_actions([(
      "setTheme",
      reducer(|mut state, payload| {
        state["theme"] = payload;
        Ok(state)
      }),
    )]);

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();
    assert_eq!(
      cache.get_item::<Value>("app_state"),
      Some(json!({ "theme": "dark" }))
    );

    let restored = Store::builder(app_state())
      .persistence(cache, &config)
      .build();
    assert!(restored.hydrate());
    assert_eq!(restored.select(|s| s["theme"].clone()), "dark");
    assert_eq!(restored.select(|s| s["user"]["name"].clone()), "ada");
  }

  #[tokio::test]
  async fn test_dispatch_emits_events() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let store = Store::builder(app_state()).events(events).build();
    store.add_actions([(
      "setTheme",
      reducer(|mut state, payload| {
        state["theme"] = payload;
        Ok(state)
      }),
    )]);

    store
      .dispatch(("setTheme", json!("dark")))
      .await
      .unwrap();

    assert_eq!(
      rx.recv().await.unwrap(),
      Event::StateChanged {
        action: Some("setTheme".to_string())
      }
    );
    assert_eq!(
      rx.recv().await.unwrap(),
      Event::ActionDispatched {
        action_type: "setTheme".to_string(),
        payload: json!("dark")
      }
    );
  }
}
