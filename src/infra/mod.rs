//! Runtime bootstrap: configuration loading and telemetry.

use std::path::Path;

use crate::config::{self, Settings};

pub mod error;
pub mod telemetry;

pub use error::InfraError;

/// Load settings and install telemetry from them.
pub fn bootstrap(config_file: Option<&Path>) -> Result<Settings, InfraError> {
    let settings = config::load(config_file)?;
    telemetry::init(&settings.logging)?;
    tracing::info!(
        stale_time_ms = settings.cache.stale_time_ms,
        gc_time_ms = settings.cache.gc_time_ms,
        retry_count = settings.cache.retry_count,
        "Cache settings loaded"
    );
    Ok(settings)
}
