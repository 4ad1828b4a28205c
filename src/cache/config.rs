//! Cache configuration.
//!
//! Controls freshness, collection, retry and timeout defaults via the
//! `[cache]` section of `lectern.toml`.

use std::time::Duration;

use super::query::{QueryOptions, RetryPolicy};

const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Cache configuration, resolved from the `[cache]` section of `lectern.toml`
/// by [`crate::config::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a fetched value is served without refetching.
    pub stale_time_ms: u64,
    /// How long an unobserved entry is kept after its last fetch.
    pub gc_time_ms: u64,
    /// Retries after a failed query fetch.
    pub retry_count: u32,
    /// Fixed delay between query retries.
    pub retry_delay_ms: u64,
    /// Per-attempt timeout for fetches and mutations; `None` waits forever.
    pub fetch_timeout_ms: Option<u64>,
    /// Period of the background collector.
    pub gc_interval_ms: u64,
    /// Abort a fetch once its last waiter detaches.
    pub cancel_orphaned_fetches: bool,
    /// Buffered cache events per subscriber before lagging.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            fetch_timeout_ms: None,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            cancel_orphaned_fetches: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Collector period, clamped to at least one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    /// Broadcast capacity, clamped to at least one slot.
    pub fn event_capacity_non_zero(&self) -> usize {
        self.event_capacity.max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }

    /// Default options applied to queries issued through a client.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: self.stale_time(),
            gc_time: self.gc_time(),
            enabled: true,
            retry: self.retry_policy(),
            timeout: self.fetch_timeout(),
        }
    }
}
