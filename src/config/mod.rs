//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "lectern";
const ENV_PREFIX: &str = "LECTERN";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings: `config/default` → `lectern` → `config_file` → `LECTERN__*`
/// environment variables, later sources winning.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    stale_time_ms: Option<u64>,
    gc_time_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    fetch_timeout_ms: Option<u64>,
    gc_interval_ms: Option<u64>,
    cancel_orphaned_fetches: Option<bool>,
    event_capacity: Option<usize>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let stale_time_ms = cache.stale_time_ms.unwrap_or(defaults.stale_time_ms);
    let gc_time_ms = cache.gc_time_ms.unwrap_or(defaults.gc_time_ms);
    if gc_time_ms < stale_time_ms {
        return Err(LoadError::invalid(
            "cache.gc_time_ms",
            format!("must be at least cache.stale_time_ms ({stale_time_ms})"),
        ));
    }

    let fetch_timeout_ms = match cache.fetch_timeout_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.fetch_timeout_ms",
                "must be greater than zero; omit it to wait indefinitely",
            ));
        }
        other => other,
    };

    let gc_interval_ms = cache.gc_interval_ms.unwrap_or(defaults.gc_interval_ms);
    if gc_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.gc_interval_ms",
            "must be greater than zero",
        ));
    }

    let event_capacity = cache.event_capacity.unwrap_or(defaults.event_capacity);
    if event_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.event_capacity",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        stale_time_ms,
        gc_time_ms,
        retry_count: cache.retry_count.unwrap_or(defaults.retry_count),
        retry_delay_ms: cache.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
        fetch_timeout_ms,
        gc_interval_ms,
        cancel_orphaned_fetches: cache
            .cancel_orphaned_fetches
            .unwrap_or(defaults.cancel_orphaned_fetches),
        event_capacity,
    })
}
