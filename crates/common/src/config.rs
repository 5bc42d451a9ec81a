use anyhow::{Context, Result};
use serde::Deserialize;
use validator::Validate;

// Default constants
pub const DEFAULT_MAX_ACTIVE_PLANS: usize = 20;
pub const DEFAULT_MAX_WORKERS: usize = 64;
pub const DEFAULT_TIME_SLICE_MS: u64 = 2000;
pub const DEFAULT_FETCH_SIZE: usize = 2048;
pub const DEFAULT_MAX_BUFFERED_ROWS: usize = 65536;
pub const DEFAULT_LOB_CHUNK_SIZE: usize = 100 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1024;
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_CACHED_ROWS: usize = 100_000;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineSettings,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Scheduling, admission and delivery knobs for the engine.
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct EngineSettings {
    /// Upper bound on concurrently active plans; further requests are parked.
    #[serde(default = "default_max_active_plans")]
    #[validate(range(min = 1))]
    pub max_active_plans: usize,

    /// Size of the worker pool that runs work items.
    #[serde(default = "default_max_workers")]
    #[validate(range(min = 1))]
    pub max_workers: usize,

    /// Processing time slice before a request yields for fairness.
    #[serde(default = "default_time_slice_ms")]
    #[validate(range(min = 1))]
    pub time_slice_ms: u64,

    #[serde(default = "default_fetch_size")]
    #[validate(range(min = 1))]
    pub default_fetch_size: usize,

    /// Rows a request may buffer ahead of the consumer before it idles.
    #[serde(default = "default_max_buffered_rows")]
    #[validate(range(min = 1))]
    pub max_buffered_rows: usize,

    #[serde(default = "default_lob_chunk_size")]
    #[validate(range(min = 1))]
    pub lob_chunk_size: usize,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_active_plans: default_max_active_plans(),
            max_workers: default_max_workers(),
            time_slice_ms: default_time_slice_ms(),
            default_fetch_size: default_fetch_size(),
            max_buffered_rows: default_max_buffered_rows(),
            lob_chunk_size: default_lob_chunk_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_max_active_plans() -> usize {
    DEFAULT_MAX_ACTIVE_PLANS
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_time_slice_ms() -> u64 {
    DEFAULT_TIME_SLICE_MS
}
fn default_fetch_size() -> usize {
    DEFAULT_FETCH_SIZE
}
fn default_max_buffered_rows() -> usize {
    DEFAULT_MAX_BUFFERED_ROWS
}
fn default_lob_chunk_size() -> usize {
    DEFAULT_LOB_CHUNK_SIZE
}
fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CacheTierSettings {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: u64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheTierSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_cache_max_entries(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CacheSettings {
    #[serde(default)]
    #[validate(nested)]
    pub result_cache: CacheTierSettings,
    #[serde(default)]
    #[validate(nested)]
    pub plan_cache: CacheTierSettings,
    /// Results with more rows than this are never cached.
    #[serde(default = "default_max_cached_rows")]
    pub max_cached_rows: usize,
    /// Directory for externalized LOB payloads; in-memory when unset.
    #[serde(default)]
    pub lob_directory: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            result_cache: CacheTierSettings::default(),
            plan_cache: CacheTierSettings::default(),
            max_cached_rows: default_max_cached_rows(),
            lob_directory: None,
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_max_entries() -> u64 {
    DEFAULT_CACHE_MAX_ENTRIES
}
fn default_cache_ttl_seconds() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}
fn default_max_cached_rows() -> usize {
    DEFAULT_MAX_CACHED_ROWS
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // SLUICE__ENGINE__MAX_ACTIVE_PLANS maps to engine.max_active_plans, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("SLUICE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_active_plans, DEFAULT_MAX_ACTIVE_PLANS);
    }

    #[test]
    fn test_zero_active_plans_rejected() {
        let config = EngineSettings {
            max_active_plans: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "engine:\n  max_active_plans: 3\n  time_slice_ms: 50\ncache:\n  max_cached_rows: 10"
        )
        .unwrap();

        let config = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.engine.max_active_plans, 3);
        assert_eq!(config.engine.time_slice_ms, 50);
        assert_eq!(config.engine.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.cache.max_cached_rows, 10);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::from_file("does/not/exist.yaml").unwrap();
        assert_eq!(config.engine.default_fetch_size, DEFAULT_FETCH_SIZE);
        assert!(config.cache.result_cache.enabled);
    }
}
