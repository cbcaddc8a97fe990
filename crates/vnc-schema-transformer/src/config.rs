//! Daemon configuration
//!
//! The engine sections (`[database]`, `[bus]`, `[engine]`, `[logging]`) are
//! shared with every sync consumer; `[transformer]` holds the route target
//! allocation settings.

use crate::error::{Result, SchemaTransformerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use vnc_sync_common::SyncConfig;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/contrail/contrail-schema.toml";

/// Route target allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Autonomous system used for auto-assigned route targets
    #[serde(default = "default_autonomous_system")]
    pub autonomous_system: u32,

    /// First route target number handed out
    #[serde(default = "default_route_target_start")]
    pub route_target_start: u32,

    /// One past the last route target number handed out
    #[serde(default = "default_route_target_end")]
    pub route_target_end: u32,
}

fn default_autonomous_system() -> u32 {
    64512
}

fn default_route_target_start() -> u32 {
    8_000_000
}

fn default_route_target_end() -> u32 {
    8_100_000
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            autonomous_system: default_autonomous_system(),
            route_target_start: default_route_target_start(),
            route_target_end: default_route_target_end(),
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Engine settings
    #[serde(flatten)]
    pub sync: SyncConfig,

    /// Route target allocation
    #[serde(default)]
    pub transformer: TransformerConfig,
}

impl DaemonConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SchemaTransformerError::invalid_config("toml", e.to_string()))
    }

    /// Load configuration from file, falling back to defaults if not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                SchemaTransformerError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SchemaTransformerError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;

        let t = &self.transformer;
        if t.autonomous_system == 0 {
            return Err(SchemaTransformerError::invalid_config(
                "transformer.autonomous_system",
                "must be > 0",
            ));
        }
        if t.route_target_start >= t.route_target_end {
            return Err(SchemaTransformerError::invalid_config(
                "transformer.route_target_start",
                format!(
                    "must be below route_target_end ({} >= {})",
                    t.route_target_start, t.route_target_end
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.transformer.autonomous_system, 64512);
        assert_eq!(config.transformer.route_target_start, 8_000_000);
        assert_eq!(config.sync.database.redis_port, 6379);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flattened_sections() {
        let config = DaemonConfig::from_toml(
            r#"
[bus]
queue_name = "vnc_config.schema-transformer"

[transformer]
autonomous_system = 65000
route_target_start = 100
route_target_end = 200
"#,
        )
        .unwrap();
        assert_eq!(config.sync.bus.queue_name, "vnc_config.schema-transformer");
        assert_eq!(config.transformer.autonomous_system, 65000);
        assert_eq!(config.transformer.route_target_end, 200);
        assert_eq!(config.sync.engine.rpc_max_attempts, 3);
    }

    #[test]
    fn test_validate_route_target_range() {
        let mut config = DaemonConfig::default();
        config.transformer.route_target_end = config.transformer.route_target_start;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transformer.route_target_start"));

        let mut config = DaemonConfig::default();
        config.sync.bus.queue_name.clear();
        assert!(matches!(
            config.validate(),
            Err(SchemaTransformerError::Sync(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transformer]\nautonomous_system = 64600").unwrap();

        let config = DaemonConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.transformer.autonomous_system, 64600);
        assert_eq!(config.transformer.route_target_start, 8_000_000);
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = DaemonConfig::load_or_default("/nonexistent/schema.toml").unwrap();
        assert_eq!(config, DaemonConfig::default());
    }
}
