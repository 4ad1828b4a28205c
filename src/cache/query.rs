//! Query runner.
//!
//! Serves cached values while they are fresh, and otherwise runs the caller's
//! fetch function on a spawned task shared by every concurrent caller of the
//! same key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::error::{BoxError, CacheError};
use super::events::{CacheEvent, EventKind};
use super::inflight::{FetchOutcome, FetchTicket, InFlight};
use super::keys::CacheKey;
use super::retry::run_with_timeout;
use super::store::{CacheStore, ObserverGuard};

pub use super::retry::{Backoff, RetryPolicy};

const METRIC_QUERY_HIT_TOTAL: &str = "lectern_query_hit_total";
const METRIC_QUERY_MISS_TOTAL: &str = "lectern_query_miss_total";
const METRIC_QUERY_STALE_TOTAL: &str = "lectern_query_stale_total";
const METRIC_FETCH_TOTAL: &str = "lectern_fetch_total";
const METRIC_FETCH_RETRY_TOTAL: &str = "lectern_fetch_retry_total";
const METRIC_FETCH_FAILURE_TOTAL: &str = "lectern_fetch_failure_total";
const METRIC_FETCH_MS: &str = "lectern_fetch_ms";

/// Per-query behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    /// A disabled query reports [`QueryState::Idle`] and never fetches.
    pub enabled: bool,
    pub retry: RetryPolicy,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        CacheConfig::default().query_options()
    }
}

/// What a caller sees for a key.
#[derive(Debug)]
pub enum QueryState<T> {
    /// The query is disabled or nothing is known about the key.
    Idle,
    /// No data yet; a fetch is running.
    Loading,
    Success { value: Arc<T>, from_cache: bool },
    /// Old data served while a refetch runs in the background.
    StaleButShowing(Arc<T>),
    Error(CacheError),
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Idle => Self::Idle,
            Self::Loading => Self::Loading,
            Self::Success { value, from_cache } => Self::Success {
                value: Arc::clone(value),
                from_cache: *from_cache,
            },
            Self::StaleButShowing(value) => Self::StaleButShowing(Arc::clone(value)),
            Self::Error(error) => Self::Error(error.clone()),
        }
    }
}

impl<T> QueryState<T> {
    /// The value to render, fresh or stale.
    pub fn value(&self) -> Option<&Arc<T>> {
        match self {
            Self::Success { value, .. } | Self::StaleButShowing(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_from_cache(&self) -> bool {
        matches!(self, Self::Success { from_cache: true, .. })
    }
}

/// Mediates between callers, the [`CacheStore`] and remote fetch functions.
pub struct QueryRunner<T> {
    store: Arc<CacheStore<T>>,
    inflight: Arc<InFlight<T>>,
}

impl<T> Clone for QueryRunner<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T> QueryRunner<T>
where
    T: Send + Sync + 'static,
{
    /// `cancel_orphaned` aborts a fetch once every waiter has detached.
    pub fn new(store: Arc<CacheStore<T>>, cancel_orphaned: bool) -> Self {
        Self {
            store,
            inflight: Arc::new(InFlight::new(cancel_orphaned)),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<T>> {
        &self.store
    }

    /// Resolve `key`: cached when fresh, stale-while-refetching when stale,
    /// fetched (once, shared with concurrent callers) when absent.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn query<F, Fut, E>(
        &self,
        key: &CacheKey,
        fetch: F,
        options: &QueryOptions,
    ) -> QueryState<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if !options.enabled {
            return QueryState::Idle;
        }

        if let Some(entry) = self.store.get(key) {
            if entry.is_fresh_at(Instant::now()) {
                counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                return QueryState::Success {
                    value: entry.into_value(),
                    from_cache: true,
                };
            }

            counter!(METRIC_QUERY_STALE_TOTAL).increment(1);
            self.start_background(key, fetch, options);
            return QueryState::StaleButShowing(entry.into_value());
        }

        counter!(METRIC_QUERY_MISS_TOTAL).increment(1);
        match self.fetch_shared(key, fetch, options).await {
            Ok(value) => QueryState::Success {
                value,
                from_cache: false,
            },
            Err(error) => QueryState::Error(error),
        }
    }

    /// Return fresh data, waiting for a fetch when the entry is stale or
    /// absent. Disabled options fail with [`CacheError::Disabled`].
    #[instrument(skip_all, fields(key = %key))]
    pub async fn fetch<F, Fut, E>(
        &self,
        key: &CacheKey,
        fetch: F,
        options: &QueryOptions,
    ) -> Result<Arc<T>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if !options.enabled {
            return Err(CacheError::Disabled);
        }

        if let Some(entry) = self.store.get(key) {
            if entry.is_fresh_at(Instant::now()) {
                counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                return Ok(entry.into_value());
            }
        }

        counter!(METRIC_QUERY_MISS_TOTAL).increment(1);
        self.fetch_shared(key, fetch, options).await
    }

    /// Start a fetch in the background unless the query is disabled, the entry
    /// is fresh or a fetch is already running.
    pub fn prefetch<F, Fut, E>(&self, key: &CacheKey, fetch: F, options: &QueryOptions)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if !options.enabled {
            return;
        }

        let fresh = self
            .store
            .get(key)
            .is_some_and(|entry| entry.is_fresh_at(Instant::now()));
        if !fresh {
            self.start_background(key, fetch, options);
        }
    }

    /// Snapshot of what an observer of `key` would render right now.
    pub fn state(&self, key: &CacheKey) -> QueryState<T> {
        match self.store.get(key) {
            Some(entry) if entry.is_fresh_at(Instant::now()) => QueryState::Success {
                value: entry.into_value(),
                from_cache: true,
            },
            Some(entry) => QueryState::StaleButShowing(entry.into_value()),
            None if self.inflight.contains(key) => QueryState::Loading,
            None => QueryState::Idle,
        }
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inflight.contains(key)
    }

    /// Register an observer for `key`; its entry is pinned against collection
    /// until the observer is dropped.
    pub fn observe(&self, key: CacheKey) -> QueryObserver<T> {
        let events = self.store.subscribe();
        let guard = self.store.observe(key.clone());
        QueryObserver {
            key,
            runner: self.clone(),
            events,
            _guard: guard,
        }
    }

    async fn fetch_shared<F, Fut, E>(
        &self,
        key: &CacheKey,
        fetch: F,
        options: &QueryOptions,
    ) -> FetchOutcome<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (waiter, ticket) = self.inflight.join(key, &self.store);
        if let Some(ticket) = ticket {
            self.spawn_fetch(key, ticket, fetch, options);
        }
        waiter.wait().await
    }

    fn start_background<F, Fut, E>(&self, key: &CacheKey, fetch: F, options: &QueryOptions)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        match self.inflight.start_detached(key, &self.store) {
            Some(ticket) => {
                debug!(key = %key, "Starting background refetch");
                self.spawn_fetch(key, ticket, fetch, options);
            }
            None => debug!(key = %key, "Refetch already in flight"),
        }
    }

    fn spawn_fetch<F, Fut, E>(
        &self,
        key: &CacheKey,
        ticket: FetchTicket,
        fetch: F,
        options: &QueryOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let completion = Completion {
            inflight: Arc::clone(&self.inflight),
            key: key.clone(),
            ticket,
            done: false,
        };
        let task = tokio::spawn(run_fetch(
            Arc::clone(&self.store),
            completion,
            fetch,
            options.clone(),
        ));
        self.inflight
            .attach_task(key, ticket.generation, task.abort_handle());
    }
}

/// Resolves the pending request when the fetch task finishes, or abandons it
/// if the task is aborted or panics first.
struct Completion<T> {
    inflight: Arc<InFlight<T>>,
    key: CacheKey,
    ticket: FetchTicket,
    done: bool,
}

impl<T> Completion<T> {
    fn is_current(&self) -> bool {
        self.inflight.is_current(&self.key, self.ticket.generation)
    }

    fn finish(mut self, outcome: FetchOutcome<T>) -> usize {
        self.done = true;
        self.inflight
            .complete(&self.key, self.ticket.generation, outcome)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if !self.done {
            self.inflight.abandon(&self.key, self.ticket.generation);
        }
    }
}

async fn run_fetch<T, F, Fut, E>(
    store: Arc<CacheStore<T>>,
    completion: Completion<T>,
    fetch: F,
    options: QueryOptions,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let key = completion.key.clone();
    let started_at = Instant::now();
    let result = fetch_with_retry(&key, &fetch, &options).await;
    histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

    let outcome = match result {
        Ok(value) => {
            let value = Arc::new(value);
            if !completion.is_current() {
                debug!(key = %key, "Superseded fetch finished; result discarded");
            } else if !store.set_fetched(
                key.clone(),
                Arc::clone(&value),
                completion.ticket.revision,
                options.stale_time,
                options.gc_time,
            ) {
                debug!(key = %key, "Fetch raced an invalidation; stored as stale");
            }
            Ok(value)
        }
        Err(error) => {
            counter!(METRIC_FETCH_FAILURE_TOTAL).increment(1);
            store.events().publish(&key, EventKind::FetchFailed);
            warn!(key = %key, error = %error, "Fetch failed; cached entry left untouched");
            Err(error)
        }
    };

    let waiters = completion.finish(outcome);
    debug!(key = %key, waiters, "Fetch settled");
}

async fn fetch_with_retry<T, F, Fut, E>(
    key: &CacheKey,
    fetch: &F,
    options: &QueryOptions,
) -> Result<T, CacheError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let mut attempt: u32 = 0;
    loop {
        counter!(METRIC_FETCH_TOTAL).increment(1);
        match run_with_timeout(options.timeout, fetch()).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < options.retry.retries && error.is_retryable() => {
                attempt += 1;
                let delay = options.retry.delay_for(attempt);
                counter!(METRIC_FETCH_RETRY_TOTAL).increment(1);
                warn!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Fetch failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// A registered interest in one key.
pub struct QueryObserver<T> {
    key: CacheKey,
    runner: QueryRunner<T>,
    events: broadcast::Receiver<CacheEvent>,
    _guard: ObserverGuard,
}

impl<T> QueryObserver<T>
where
    T: Send + Sync + 'static,
{
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> QueryState<T> {
        self.runner.state(&self.key)
    }

    /// Wait for the next event concerning this observer's key. Returns `None`
    /// once the store is gone.
    pub async fn next_event(&mut self) -> Option<CacheEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.key == self.key => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Observer lagged behind cache events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
