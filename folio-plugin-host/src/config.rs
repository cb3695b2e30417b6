//! Runtime configuration
//!
//! Every component takes a plain config struct with sensible defaults. A
//! [`HostConfig`] bundles them and can be read from a TOML file; durations
//! are expressed in milliseconds there.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// VM pool sizing and acquisition window
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Handles available to ordinary checkouts
    pub general: usize,

    /// Handles only hook dispatch may fall back to
    pub reserved: usize,

    /// Longest a checkout waits for a free handle
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,

    /// Default per-checkout data-access operation ceiling
    pub op_budget: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            general: 4,
            reserved: 1,
            acquire_timeout: Duration::from_secs(5),
            op_budget: 1000,
        }
    }
}

impl PoolConfig {
    /// Total number of handles
    pub fn size(&self) -> usize {
        self.general + self.reserved
    }
}

/// Lifecycle manager settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory scanned for plugin subdirectories
    pub plugins_dir: PathBuf,

    /// Version reported to `min_host_version` checks
    pub host_version: String,

    /// Deadline for a plugin's startup routine
    #[serde(rename = "startup_timeout_ms", with = "millis")]
    pub startup_timeout: Duration,

    /// Deadline for a plugin's shutdown routine
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,

    pub pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            pool: PoolConfig::default(),
        }
    }
}

/// Hook dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Budget for a whole synchronous chain
    #[serde(rename = "before_event_timeout_ms", with = "millis")]
    pub before_event_timeout: Duration,

    /// Budget for one synchronous handler
    #[serde(rename = "before_hook_timeout_ms", with = "millis")]
    pub before_hook_timeout: Duration,

    /// Budget for one asynchronous handler
    #[serde(rename = "after_hook_timeout_ms", with = "millis")]
    pub after_hook_timeout: Duration,

    /// Concurrent asynchronous handlers
    pub after_concurrency: usize,

    /// Consecutive failures before a hook is disabled
    pub fault_threshold: u32,

    /// Data-access operation ceiling for asynchronous handlers
    pub after_op_budget: u32,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            before_event_timeout: Duration::from_secs(2),
            before_hook_timeout: Duration::from_millis(500),
            after_hook_timeout: Duration::from_secs(5),
            after_concurrency: 16,
            fault_threshold: 5,
            after_op_budget: 100,
        }
    }
}

/// Per-plugin circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,

    /// Time since the last failure before a probe is let through
    #[serde(rename = "reset_interval_ms", with = "millis")]
    pub reset_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_interval: Duration::from_secs(30),
        }
    }
}

/// Wasm execution limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Fuel granted to every guest call
    pub fuel_per_call: u64,

    /// Deadline for the guest's declaration routine when a handle is built
    #[serde(rename = "declare_timeout_ms", with = "millis")]
    pub declare_timeout: Duration,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 10_000_000,
            declare_timeout: Duration::from_secs(5),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,

    /// Single-line output
    Compact,

    /// One JSON object per event
    Json,
}

/// Subscriber settings used by `init_subscriber`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` (then `info`) when absent
    pub level: Option<String>,
    pub format: LogFormat,
    pub timestamps: bool,
    pub target: bool,
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Pretty,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

/// Complete host configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub manager: ManagerConfig,
    pub hooks: HookConfig,
    pub breaker: BreakerConfig,
    pub wasm: WasmConfig,
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.manager.pool;
        if pool.general == 0 {
            return Err(ConfigError::Invalid("pool.general must be at least 1".into()));
        }
        if pool.reserved >= pool.general {
            return Err(ConfigError::Invalid(
                "pool.reserved must be smaller than pool.general".into(),
            ));
        }
        if pool.acquire_timeout.is_zero() {
            return Err(ConfigError::Invalid("pool.acquire_timeout_ms must be positive".into()));
        }
        if self.hooks.fault_threshold == 0 {
            return Err(ConfigError::Invalid("hooks.fault_threshold must be at least 1".into()));
        }
        if self.hooks.after_concurrency == 0 {
            return Err(ConfigError::Invalid("hooks.after_concurrency must be at least 1".into()));
        }
        if self.hooks.before_hook_timeout > self.hooks.before_event_timeout {
            return Err(ConfigError::Invalid(
                "hooks.before_hook_timeout_ms exceeds hooks.before_event_timeout_ms".into(),
            ));
        }
        if self.wasm.fuel_per_call == 0 {
            return Err(ConfigError::Invalid("wasm.fuel_per_call must be positive".into()));
        }
        if self.breaker.threshold == 0 {
            return Err(ConfigError::Invalid("breaker.threshold must be at least 1".into()));
        }
        Ok(())
    }
}

/// Get the default plugin root for an application
pub fn default_plugin_root(app_name: &str) -> PathBuf {
    match dirs::data_local_dir() {
        Some(data_dir) => data_dir.join(app_name).join("plugins"),
        None => PathBuf::from("plugins"),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager.pool.size(), 5);
        assert_eq!(config.hooks.fault_threshold, 5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = HostConfig::from_toml_str(
            r#"
            [manager]
            plugins_dir = "/srv/cms/plugins"
            startup_timeout_ms = 2500

            [manager.pool]
            general = 8
            reserved = 2

            [hooks]
            fault_threshold = 3

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.manager.plugins_dir, PathBuf::from("/srv/cms/plugins"));
        assert_eq!(config.manager.startup_timeout, Duration::from_millis(2500));
        assert_eq!(config.manager.pool.general, 8);
        assert_eq!(config.manager.pool.reserved, 2);
        assert_eq!(config.manager.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.hooks.fault_threshold, 3);
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.wasm.fuel_per_call, 10_000_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.timestamps);
    }

    #[test]
    fn test_rejects_reserved_not_smaller() {
        let result = HostConfig::from_toml_str(
            r#"
            [manager.pool]
            general = 2
            reserved = 2
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = HostConfig::load("/nonexistent/folio.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_default_plugin_root() {
        assert!(default_plugin_root("folio").ends_with("plugins"));
    }
}
