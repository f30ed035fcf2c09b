//! Client-side core of the NeoForge frontend: a reactive state store, a
//! persistent TTL cache with an offline action queue, connectivity tracking
//! and a resilient HTTP request layer.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod logging;
pub mod store;

pub use api::{ApiClient, RequestOptions, RequestOutcome};
pub use cache::{CacheSource, CacheStats, OfflineCache};
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use error::{ErrorKind, RequestError, StoreError};
pub use event::{Event, EventBus};
pub use store::{Action, Store};
