//! Configuration file support for sync engine consumers.
//!
//! Loads and validates engine configuration from TOML. Every field has a
//! default, so an empty or missing file yields a usable configuration.

use crate::consumer::ConsumerOptions;
use crate::engine::TrackerOptions;
use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Backing store connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number holding config objects
    #[serde(default = "default_config_db_number")]
    pub config_db_number: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Notification bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue the consumer subscribes to
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Wait per receive call in milliseconds
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,
}

/// Propagation and resync tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt timeout of store RPCs in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Attempts per store RPC
    #[serde(default = "default_rpc_max_attempts")]
    pub rpc_max_attempts: u32,

    /// Pause between RPC attempts in milliseconds
    #[serde(default = "default_rpc_backoff")]
    pub rpc_backoff_ms: u64,

    /// Yield to the runtime this often during resync evaluation (0 = never)
    #[serde(default = "default_resync_yield_interval")]
    pub resync_yield_interval_ms: u64,

    /// Pause before reconnecting in milliseconds
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Read referents missing from the cache from the store
    #[serde(default = "default_resolve_missing")]
    pub resolve_missing_from_store: bool,
}

/// Logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backing store connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Notification bus
    #[serde(default)]
    pub bus: BusConfig,

    /// Propagation and resync tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_config_db_number() -> u32 {
    4
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_queue_name() -> String {
    "vnc_config.object-update".to_string()
}

fn default_recv_timeout() -> u64 {
    1000
}

fn default_rpc_timeout() -> u64 {
    2000
}

fn default_rpc_max_attempts() -> u32 {
    3
}

fn default_rpc_backoff() -> u64 {
    100
}

fn default_resync_yield_interval() -> u64 {
    100
}

fn default_reconnect_backoff() -> u64 {
    2000
}

fn default_resolve_missing() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            config_db_number: default_config_db_number(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            recv_timeout_ms: default_recv_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout(),
            rpc_max_attempts: default_rpc_max_attempts(),
            rpc_backoff_ms: default_rpc_backoff(),
            resync_yield_interval_ms: default_resync_yield_interval(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            resolve_missing_from_store: default_resolve_missing(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::invalid_config("toml", e.to_string()))
    }

    /// Load configuration from file, falling back to defaults if not found
    pub fn load_or_default(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                SyncError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.redis_host.is_empty() {
            return Err(SyncError::invalid_config("database.redis_host", "must not be empty"));
        }
        if self.database.redis_port == 0 {
            return Err(SyncError::invalid_config("database.redis_port", "must be > 0"));
        }
        if self.bus.queue_name.is_empty() {
            return Err(SyncError::invalid_config("bus.queue_name", "must not be empty"));
        }
        if self.bus.recv_timeout_ms == 0 {
            return Err(SyncError::invalid_config("bus.recv_timeout_ms", "must be > 0"));
        }
        if self.engine.rpc_timeout_ms == 0 {
            return Err(SyncError::invalid_config("engine.rpc_timeout_ms", "must be > 0"));
        }
        if self.engine.rpc_max_attempts == 0 {
            return Err(SyncError::invalid_config("engine.rpc_max_attempts", "must be >= 1"));
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connection_timeout_secs)
    }

    /// Get the store RPC retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.engine.rpc_timeout_ms),
            self.engine.rpc_max_attempts,
            Duration::from_millis(self.engine.rpc_backoff_ms),
        )
    }

    /// Get the propagation options
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            resolve_missing_from_store: self.engine.resolve_missing_from_store,
            retry: self.retry_policy(),
        }
    }

    /// Get the consumer options
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            queue_name: self.bus.queue_name.clone(),
            recv_timeout: Duration::from_millis(self.bus.recv_timeout_ms),
            reconnect_backoff: Duration::from_millis(self.engine.reconnect_backoff_ms),
        }
    }

    /// Get resync yield interval as Duration
    pub fn resync_yield_interval(&self) -> Duration {
        Duration::from_millis(self.engine.resync_yield_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.database.redis_host, "127.0.0.1");
        assert_eq!(config.database.redis_port, 6379);
        assert_eq!(config.bus.queue_name, "vnc_config.object-update");
        assert!(config.engine.resolve_missing_from_store);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = SyncConfig::default();
        config.database.redis_port = 0;
        assert!(config.validate().unwrap_err().is_fatal());

        let mut config = SyncConfig::default();
        config.engine.rpc_max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine.rpc_max_attempts"));

        let mut config = SyncConfig::default();
        config.bus.queue_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_options() {
        let config = SyncConfig::default();
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(Duration::from_millis(2000), 3, Duration::from_millis(100))
        );
        assert_eq!(config.consumer_options().recv_timeout, Duration::from_secs(1));
        assert_eq!(config.resync_yield_interval(), Duration::from_millis(100));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_deserialization() {
        let config = SyncConfig::from_toml(
            r#"
[database]
redis_host = "10.0.0.5"

[engine]
rpc_timeout_ms = 500
resolve_missing_from_store = false

[logging]
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.database.redis_host, "10.0.0.5");
        assert_eq!(config.engine.rpc_timeout_ms, 500);
        assert!(!config.tracker_options().resolve_missing_from_store);
        assert!(config.logging.json);
        // Unspecified values use defaults
        assert_eq!(config.database.redis_port, 6379);
        assert_eq!(config.engine.rpc_max_attempts, 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\nqueue_name = \"schema_transformer.test\"").unwrap();

        let config = SyncConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.bus.queue_name, "schema_transformer.test");
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nrpc_timeout_ms = \"soon\"").unwrap();

        let err = SyncConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = SyncConfig::load_or_default("/nonexistent/path.conf").unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}
