//! Configuration management for wg-portal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wg-portal/config.toml";

/// Environment variable overriding the encryption key file.
pub const ENCRYPTION_KEY_ENV: &str = "WG_PORTAL_ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/wg-portal/portal.db"),
        }
    }
}

/// Encryption key configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Path to a file containing the 32-byte master key (hex or base64).
    pub key_file: Option<PathBuf>,
}

impl EncryptionConfig {
    /// Resolve the master key string. The environment variable wins over
    /// the configured key file.
    pub fn load_key(&self) -> Result<String, ConfigError> {
        if let Ok(key) = std::env::var(ENCRYPTION_KEY_ENV) {
            return Ok(key);
        }

        if let Some(path) = &self.key_file {
            return Ok(std::fs::read_to_string(path)?);
        }

        Err(ConfigError::ValidationError(format!(
            "no encryption key configured (set encryption.key_file or {ENCRYPTION_KEY_ENV})"
        )))
    }
}

/// Peer import configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Directory scanned for `*.conf` files.
    pub directory: PathBuf,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/wg-portal/import"),
        }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    pub import: ImportConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.listen_port == 0 {
            return Err(ConfigError::ValidationError(
                "api.listen_port must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}
