//! Retry and timeout policies for remote operations.

use std::future::Future;
use std::time::Duration;

use super::error::{BoxError, CacheError};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// How many times a failed query fetch is re-run, and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(1, DEFAULT_RETRY_DELAY)
    }
}

/// Await `operation`, mapping its error and an elapsed `timeout` into
/// [`CacheError`].
pub(crate) async fn run_with_timeout<T, E, Fut>(
    timeout: Option<Duration>,
    operation: Fut,
) -> Result<T, CacheError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| CacheError::Timeout(limit))?,
        None => operation.await,
    };
    result.map_err(CacheError::network)
}
