//! Configuration management for the meridian launcher.
//!
//! One TOML file configures all three roles; each process reads the sections
//! relevant to its subcommand. Missing optional fields take the defaults
//! below, and `validate()` rejects inconsistent files before anything binds
//! a socket.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

fn default_dispatcher_address() -> String {
    "127.0.0.1:7100".to_string()
}

fn default_client_bind_address() -> String {
    "127.0.0.1:7200".to_string()
}

fn default_server_id() -> u16 {
    1
}

fn default_gate_id() -> u16 {
    1
}

fn default_save_interval_secs() -> u64 {
    300
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dispatcher settings (listen address; dialed by servers and gates).
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    /// Entity server settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Gate settings.
    #[serde(default)]
    pub gate: GateSettings,
    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Dispatcher-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Address the dispatcher listens on and every peer dials.
    #[serde(default = "default_dispatcher_address")]
    pub address: String,
}

/// Entity-server-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Stable numeric identity; survives restarts.
    #[serde(default = "default_server_id")]
    pub id: u16,
    /// Entity type created and bound for each fresh client session.
    #[serde(default)]
    pub account_entity_type: Option<String>,
    /// Seconds between persistence passes over dirty entities.
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

/// Gate-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    /// Stable numeric identity; survives restarts.
    #[serde(default = "default_gate_id")]
    pub id: u16,
    /// Address clients connect to.
    #[serde(default = "default_client_bind_address")]
    pub client_bind_address: String,
}

/// Storage backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Backend selector. `memory` is built in; external backends plug in
    /// behind the same interface.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json_format: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            address: default_dispatcher_address(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            id: default_server_id(),
            account_entity_type: None,
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            id: default_gate_id(),
            client_bind_address: default_client_bind_address(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherSettings::default(),
            server: ServerSettings::default(),
            gate: GateSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes a default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// The server's save interval as a `Duration`.
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.server.save_interval_secs)
    }

    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.dispatcher.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "invalid dispatcher address: {}",
                self.dispatcher.address
            ));
        }
        if self
            .gate
            .client_bind_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(format!(
                "invalid gate client bind address: {}",
                self.gate.client_bind_address
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            ));
        }

        if self.storage.backend != "memory" {
            return Err(format!(
                "unknown storage backend: {}. Only \"memory\" is built in",
                self.storage.backend
            ));
        }

        if self.server.save_interval_secs == 0 {
            return Err("server.save_interval_secs must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use tokio::fs;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.address, "127.0.0.1:7100");
        assert_eq!(config.server.id, 1);
        assert_eq!(config.gate.id, 1);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.save_interval(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn load_from_existing_file() {
        let toml_content = r#"
[dispatcher]
address = "0.0.0.0:9100"

[server]
id = 7
account_entity_type = "Account"
save_interval_secs = 60

[gate]
id = 3
client_bind_address = "0.0.0.0:9200"

[logging]
level = "debug"
json_format = true
"#;
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&temp_file.path().to_path_buf())
            .await
            .expect("load");
        assert_eq!(config.dispatcher.address, "0.0.0.0:9100");
        assert_eq!(config.server.id, 7);
        assert_eq!(config.server.account_entity_type.as_deref(), Some("Account"));
        assert_eq!(config.server.save_interval_secs, 60);
        assert_eq!(config.gate.id, 3);
        assert_eq!(config.gate.client_bind_address, "0.0.0.0:9200");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.toml");

        let config = AppConfig::load_from_file(&path).await.expect("load");
        assert_eq!(config.server.id, 1);
        assert!(path.exists());
    }

    #[test]
    fn partial_sections_take_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[server]
id = 9
"#,
        )
        .expect("parse");
        assert_eq!(config.server.id, 9);
        assert_eq!(config.server.save_interval_secs, 300);
        assert_eq!(config.dispatcher.address, "127.0.0.1:7100");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.dispatcher.address = "not-an-address".into();
        assert!(config.validate().unwrap_err().contains("dispatcher address"));

        let mut config = AppConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().unwrap_err().contains("log level"));

        let mut config = AppConfig::default();
        config.storage.backend = "redis".into();
        assert!(config.validate().unwrap_err().contains("storage backend"));

        let mut config = AppConfig::default();
        config.server.save_interval_secs = 0;
        assert!(config.validate().unwrap_err().contains("save_interval_secs"));
    }
}
