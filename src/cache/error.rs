use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by caller-supplied fetch and mutation functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure of a fetch or mutation as seen by callers.
///
/// Cloneable so one outcome can be handed to every waiter of a shared fetch.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("network failure: {0}")]
    NetworkFailure(Arc<dyn StdError + Send + Sync + 'static>),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled before completion")]
    Cancelled,
    /// The query options had `enabled` unset, so nothing was fetched.
    #[error("query is disabled")]
    Disabled,
}

impl CacheError {
    pub fn network(error: impl Into<BoxError>) -> Self {
        Self::NetworkFailure(Arc::from(error.into()))
    }

    /// Whether a query retry policy may re-run the operation.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Disabled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
