//! Lectern query cache.
//!
//! Sits between the back office and the remote table API:
//!
//! - **[`CacheStore`]**: cached results keyed by [`CacheKey`], with freshness
//!   and collection horizons
//! - **[`QueryRunner`]**: serves fresh entries, otherwise runs one shared
//!   fetch per key with retry and timeout
//! - **[`MutationRunner`]**: runs a write once and invalidates affected keys
//!   after it is confirmed
//!
//! [`QueryClient`] wires the three together around a single store.
//!
//! ## Configuration
//!
//! Defaults are read from the `[cache]` section of `lectern.toml`:
//!
//! ```toml
//! [cache]
//! stale_time_ms = 0
//! gc_time_ms = 300000
//! retry_count = 1
//! retry_delay_ms = 1000
//! # ... see config.rs for all options
//! ```

mod client;
mod collector;
mod config;
mod entry;
mod error;
mod events;
mod inflight;
mod keys;
mod lock;
mod mutation;
mod query;
mod retry;
mod store;

pub use client::QueryClient;
pub use collector::{CollectorHandle, spawn_collector};
pub use config::CacheConfig;
pub use entry::{CacheEntry, Freshness};
pub use error::{BoxError, CacheError};
pub use events::{CacheEvent, Epoch, EventBus, EventKind};
pub use keys::{CacheKey, KeySegment};
pub use mutation::{MutationOptions, MutationRunner};
pub use query::{Backoff, QueryObserver, QueryOptions, QueryRunner, QueryState, RetryPolicy};
pub use store::{CacheStore, ObserverGuard};
