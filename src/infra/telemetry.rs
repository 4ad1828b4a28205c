use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Fails when a global subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the cache emits. Safe to
/// call more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "lectern_query_hit_total",
            Unit::Count,
            "Queries answered from a fresh cache entry."
        );
        describe_counter!(
            "lectern_query_miss_total",
            Unit::Count,
            "Queries that had to wait for a fetch."
        );
        describe_counter!(
            "lectern_query_stale_total",
            Unit::Count,
            "Queries answered with stale data while a refetch ran."
        );
        describe_counter!(
            "lectern_fetch_total",
            Unit::Count,
            "Fetch attempts, retries included."
        );
        describe_counter!(
            "lectern_fetch_retry_total",
            Unit::Count,
            "Fetch attempts scheduled after a failure."
        );
        describe_counter!(
            "lectern_fetch_failure_total",
            Unit::Count,
            "Fetches that failed after exhausting their retries."
        );
        describe_counter!(
            "lectern_cache_evict_total",
            Unit::Count,
            "Entries removed after their collection horizon passed."
        );
        describe_counter!(
            "lectern_cache_invalidate_total",
            Unit::Count,
            "Entries marked stale by invalidation."
        );
        describe_counter!(
            "lectern_mutation_total",
            Unit::Count,
            "Mutations run, labelled by outcome."
        );
        describe_histogram!(
            "lectern_fetch_ms",
            Unit::Milliseconds,
            "Fetch latency in milliseconds, retries included."
        );
    });
}
