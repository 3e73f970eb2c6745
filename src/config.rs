//! Configuration: loaded from a TOML document, then overridden field-by-
//! field by `VIDEONODE_*` environment variables.
//!
//! Design reference: spec §6 recognized core knobs; §9 "Reflective config
//! binding" redesign flag (explicit field table, no reflection).

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw TOML shape. Every field is optional so a partial document (or none
/// at all, relying purely on defaults/env) is valid.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    observability: RawObservability,
}

#[derive(Debug, Default, Deserialize)]
struct RawObservability {
    retention_secs: Option<u64>,
    max_points_per_series: Option<usize>,
    max_series: Option<usize>,
    worker_count: Option<usize>,
    data_chan_size: Option<usize>,
    pull_enabled: Option<bool>,
    push_enabled: Option<bool>,
    pull_buffer_size: Option<usize>,
    push_channel_capacity: Option<usize>,
    push_log_level: Option<String>,
    log_level: Option<String>,
    bind_address: Option<String>,
    progress_socket_dir: Option<String>,
}

/// The crate's configuration (spec §6 table).
#[derive(Debug, Clone)]
pub struct Config {
    /// Max age of any series; older series are fully evicted.
    pub retention: Duration,
    /// Ring capacity per series.
    pub max_points_per_series: usize,
    /// Cap on distinct series.
    pub max_series: usize,
    /// Bus consumer parallelism.
    pub worker_count: usize,
    /// Bus capacity.
    pub data_chan_size: usize,
    /// Register the pull exporter.
    pub pull_enabled: bool,
    /// Register the push exporter.
    pub push_enabled: bool,
    /// Pull exporter's export buffer size.
    pub pull_buffer_size: usize,
    /// Push exporter's SSE broadcast channel capacity.
    pub push_channel_capacity: usize,
    /// Minimum log level forwarded by the push exporter.
    pub push_log_level: crate::model::Level,
    /// Process-wide tracing filter directive.
    pub log_level: String,
    /// HTTP bind address for the merged pull+push router.
    pub bind_address: String,
    /// Base directory under which progress sockets are created.
    pub progress_socket_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            max_points_per_series: 1_000,
            max_series: 10_000,
            worker_count: 4,
            data_chan_size: 1_024,
            pull_enabled: true,
            push_enabled: true,
            pull_buffer_size: 4_096,
            push_channel_capacity: 256,
            push_log_level: crate::model::Level::Info,
            log_level: "videonode_observability=info".to_owned(),
            bind_address: "0.0.0.0:9100".to_owned(),
            progress_socket_dir: std::env::temp_dir().display().to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (if it exists) then apply `VIDEONODE_*` environment
    /// variable overrides. A missing file is not an error: defaults plus
    /// env overrides are a valid configuration (spec §6).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            RawConfig::default()
        };

        let mut config = Self::default();
        let obs = raw.observability;

        if let Some(v) = obs.retention_secs {
            config.retention = Duration::from_secs(v);
        }
        if let Some(v) = obs.max_points_per_series {
            config.max_points_per_series = v;
        }
        if let Some(v) = obs.max_series {
            config.max_series = v;
        }
        if let Some(v) = obs.worker_count {
            config.worker_count = v;
        }
        if let Some(v) = obs.data_chan_size {
            config.data_chan_size = v;
        }
        if let Some(v) = obs.pull_enabled {
            config.pull_enabled = v;
        }
        if let Some(v) = obs.push_enabled {
            config.push_enabled = v;
        }
        if let Some(v) = obs.pull_buffer_size {
            config.pull_buffer_size = v;
        }
        if let Some(v) = obs.push_channel_capacity {
            config.push_channel_capacity = v;
        }
        if let Some(v) = obs.push_log_level.and_then(|s| s.parse().ok()) {
            config.push_log_level = v;
        }
        if let Some(v) = obs.log_level {
            config.log_level = v;
        }
        if let Some(v) = obs.bind_address {
            config.bind_address = v;
        }
        if let Some(v) = obs.progress_socket_dir {
            config.progress_socket_dir = v;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// `VIDEONODE_*` environment overrides, one explicit line per field
    /// (spec §9: no reflection-based binding).
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parsed::<u64>("VIDEONODE_RETENTION_SECS") {
            self.retention = Duration::from_secs(v);
        }
        if let Some(v) = env_parsed("VIDEONODE_MAX_POINTS_PER_SERIES") {
            self.max_points_per_series = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_MAX_SERIES") {
            self.max_series = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_WORKER_COUNT") {
            self.worker_count = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_DATA_CHAN_SIZE") {
            self.data_chan_size = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_PULL_ENABLED") {
            self.pull_enabled = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_PUSH_ENABLED") {
            self.push_enabled = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_PULL_BUFFER_SIZE") {
            self.pull_buffer_size = v;
        }
        if let Some(v) = env_parsed("VIDEONODE_PUSH_CHANNEL_CAPACITY") {
            self.push_channel_capacity = v;
        }
        if let Ok(v) = env::var("VIDEONODE_PUSH_LOG_LEVEL") {
            if let Ok(level) = v.parse() {
                self.push_log_level = level;
            }
        }
        if let Ok(v) = env::var("VIDEONODE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("VIDEONODE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = env::var("VIDEONODE_PROGRESS_SOCKET_DIR") {
            self.progress_socket_dir = v;
        }
    }

    /// A default configuration for unit/integration tests, in the teacher's
    /// `default_for_test` style: fast tickers, tiny caps, loopback bind.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            retention: Duration::from_secs(60),
            max_points_per_series: 64,
            max_series: 128,
            worker_count: 2,
            data_chan_size: 64,
            pull_enabled: true,
            push_enabled: true,
            pull_buffer_size: 256,
            push_channel_capacity: 64,
            push_log_level: crate::model::Level::Info,
            log_level: "videonode_observability=debug".to_owned(),
            bind_address: "127.0.0.1:0".to_owned(),
            progress_socket_dir: std::env::temp_dir().display().to_string(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
