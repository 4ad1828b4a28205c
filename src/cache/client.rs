//! Query client.
//!
//! The composition root of the cache: one explicitly constructed store shared
//! by a query runner and a mutation runner. Clone it and hand it to whatever
//! needs cached data; there is no global instance.

use std::future::Future;
use std::sync::Arc;

use super::collector::{CollectorHandle, spawn_collector};
use super::config::CacheConfig;
use super::error::{BoxError, CacheError};
use super::keys::CacheKey;
use super::mutation::{MutationOptions, MutationRunner};
use super::query::{QueryObserver, QueryOptions, QueryRunner, QueryState};
use super::store::CacheStore;

pub struct QueryClient<T> {
    config: CacheConfig,
    store: Arc<CacheStore<T>>,
    queries: QueryRunner<T>,
    mutations: MutationRunner<T>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            queries: self.queries.clone(),
            mutations: self.mutations.clone(),
        }
    }
}

impl<T> QueryClient<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(&config));
        Self::with_store(config, store)
    }

    /// Build a client around an existing store.
    pub fn with_store(config: CacheConfig, store: Arc<CacheStore<T>>) -> Self {
        let queries = QueryRunner::new(Arc::clone(&store), config.cancel_orphaned_fetches);
        let mutations = MutationRunner::new(
            Arc::clone(&store),
            MutationOptions {
                timeout: config.fetch_timeout(),
            },
        );
        Self {
            config,
            store,
            queries,
            mutations,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore<T>> {
        &self.store
    }

    pub fn queries(&self) -> &QueryRunner<T> {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationRunner<T> {
        &self.mutations
    }

    /// Query options derived from the client configuration.
    pub fn default_query_options(&self) -> QueryOptions {
        self.config.query_options()
    }

    pub async fn query<F, Fut, E>(&self, key: &CacheKey, fetch: F) -> QueryState<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.queries
            .query(key, fetch, &self.default_query_options())
            .await
    }

    pub async fn query_with<F, Fut, E>(
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
        self.queries.query(key, fetch, options).await
    }

    pub async fn fetch<F, Fut, E>(&self, key: &CacheKey, fetch: F) -> Result<Arc<T>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.queries
            .fetch(key, fetch, &self.default_query_options())
            .await
    }

    pub async fn mutate<F, Fut, R, E>(
        &self,
        mutation: F,
        invalidate_keys: &[CacheKey],
    ) -> Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        self.mutations.mutate(mutation, invalidate_keys).await
    }

    pub fn observe(&self, key: CacheKey) -> QueryObserver<T> {
        self.queries.observe(key)
    }

    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        self.store.invalidate(prefix)
    }

    /// Start the periodic collector at the configured interval.
    pub fn spawn_collector(&self) -> CollectorHandle {
        spawn_collector(Arc::clone(&self.store), self.config.gc_interval())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache_key;

    #[tokio::test(start_paused = true)]
    async fn runners_share_one_store() {
        let client = QueryClient::<Vec<u32>>::new(CacheConfig {
            stale_time_ms: 60_000,
            ..Default::default()
        });
        let key = cache_key!["admin", "formations", "all"];

        let state = client
            .query(&key, || async { Ok::<_, BoxError>(vec![1, 2]) })
            .await;
        assert!(state.is_success());

        client
            .mutate(|| async { Ok::<_, BoxError>(()) }, &[cache_key!["admin", "formations"]])
            .await
            .expect("mutation");

        let entry = client.store().get(&key).expect("entry kept after invalidation");
        assert!(entry.is_stale_at(tokio::time::Instant::now()));
        assert!(matches!(
            client.queries().state(&key),
            QueryState::StaleButShowing(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clones_see_the_same_entries() {
        let client = QueryClient::<String>::new(CacheConfig::default());
        let other = client.clone();

        client.store().set(
            cache_key!["public", "blog"],
            "posts".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert_eq!(other.store().len(), 1);
        assert_eq!(other.invalidate(&cache_key!["public"]), 1);
    }
}
