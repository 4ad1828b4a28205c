//! Mutation runner.
//!
//! Runs a write exactly once and, only after it is confirmed, invalidates the
//! cache keys it affects so the next read refetches.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{info, instrument, warn};

use super::error::{BoxError, CacheError};
use super::keys::CacheKey;
use super::retry::run_with_timeout;
use super::store::CacheStore;

const METRIC_MUTATION_TOTAL: &str = "lectern_mutation_total";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOptions {
    pub timeout: Option<Duration>,
}

pub struct MutationRunner<T> {
    store: Arc<CacheStore<T>>,
    defaults: MutationOptions,
}

impl<T> Clone for MutationRunner<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            defaults: self.defaults.clone(),
        }
    }
}

impl<T> MutationRunner<T> {
    pub fn new(store: Arc<CacheStore<T>>, defaults: MutationOptions) -> Self {
        Self { store, defaults }
    }

    /// Run `mutation` once with the default options and invalidate every key
    /// (or key prefix) in `invalidate_keys` when it succeeds.
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
        self.mutate_with(&self.defaults, mutation, invalidate_keys)
            .await
    }

    /// A failed or timed-out mutation leaves the cache untouched; it is never
    /// retried here.
    #[instrument(skip_all, fields(keys = invalidate_keys.len()))]
    pub async fn mutate_with<F, Fut, R, E>(
        &self,
        options: &MutationOptions,
        mutation: F,
        invalidate_keys: &[CacheKey],
    ) -> Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        match run_with_timeout(options.timeout, mutation()).await {
            Ok(value) => {
                let invalidated: usize = invalidate_keys
                    .iter()
                    .map(|key| self.store.invalidate(key))
                    .sum();
                counter!(METRIC_MUTATION_TOTAL, "outcome" => "success").increment(1);
                info!(
                    prefixes = invalidate_keys.len(),
                    invalidated, "Mutation confirmed; cache invalidated"
                );
                Ok(value)
            }
            Err(error) => {
                counter!(METRIC_MUTATION_TOTAL, "outcome" => "failure").increment(1);
                warn!(error = %error, "Mutation failed; cache left untouched");
                Err(error)
            }
        }
    }
}
