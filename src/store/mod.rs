//! Reactive state store.
//!
//! `dispatch(action)` runs the middleware chain, then the reducer registered for
//! the action type. If the resulting state differs from the previous one it
//! replaces the state tree, notifies the subscribers whose slice changed, and
//! persists the whitelisted slices into the offline cache.

mod binding;
mod state;

pub use binding::{bind, StoreBinding};
pub use state::{
  async_reducer, logging_middleware, middleware, reducer, Action, ErrorMiddlewareFn, MiddlewareFn,
  ReducerFn, SelectorFn, Store, StoreBuilder, SubscribeOptions, SubscriberFn, Subscription,
};
