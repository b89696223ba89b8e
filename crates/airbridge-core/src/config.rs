/*!
 * Configuration management for AirBridge.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for AirBridge components: logging, transport tuning, the reconnection
 * policy and the list of devices to bridge.
 */
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "airbridge";

/// Core configuration for AirBridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Reconnection policy configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Devices to bridge
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Transport configuration shared by every device connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Broker port on the device
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deadline for the broker to acknowledge a new session
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// MQTT keep-alive interval
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Capacity of the transport event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Reconnection policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether dropped connections are re-established automatically
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,

    /// Delay before the first attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the exponential delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Attempts before giving up (0 means never give up)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// A single device entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial number (also the MQTT username)
    pub serial: String,

    /// Product family code, e.g. "438" or "527"
    pub product_type: String,

    /// Host name or IP address of the device
    #[serde(default)]
    pub address: Option<String>,

    /// Local credential as stored by the vendor cloud account
    #[serde(default)]
    pub credential: Option<String>,

    /// Wi-Fi password printed on the device label
    #[serde(default)]
    pub password: Option<String>,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceConfig {
    /// Resolve the local credential used to authenticate against the device broker.
    ///
    /// An explicit `credential` wins; otherwise the label password is hashed
    /// (SHA-512, base64) the same way the vendor app derives it.
    pub fn local_credential(&self) -> Result<String> {
        if let Some(credential) = &self.credential {
            return Ok(credential.clone());
        }
        match &self.password {
            Some(password) => Ok(hash_label_password(password)),
            None => Err(Error::config(format!(
                "Device {} has neither a credential nor a label password",
                self.serial
            ))),
        }
    }

    /// Display name, falling back to the serial number
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }
}

/// Derive the local MQTT credential from the password printed on the device label
pub fn hash_label_password(password: &str) -> String {
    let digest = Sha512::digest(password.as_bytes());
    BASE64.encode(digest)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl TransportConfig {
    /// Connection deadline as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep-alive interval as a duration
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Config {
    /// Check the loaded values for obvious mistakes
    pub fn validate(&self) -> Result<()> {
        if self.transport.connect_timeout_ms == 0 {
            return Err(Error::config("transport.connect_timeout_ms must be positive"));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(Error::config(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms",
            ));
        }

        let mut serials = std::collections::HashSet::new();
        for device in &self.devices {
            if device.serial.trim().is_empty() {
                return Err(Error::config("device serial must not be empty"));
            }
            if device.product_type.trim().is_empty() {
                return Err(Error::config(format!(
                    "device {} has an empty product_type",
                    device.serial
                )));
            }
            if !serials.insert(device.serial.as_str()) {
                return Err(Error::config(format!(
                    "device {} is configured more than once",
                    device.serial
                )));
            }
        }

        Ok(())
    }

    /// Find a device entry by serial number
    pub fn device(&self, serial: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!(devices = config.devices.len(), "Configuration loaded successfully");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn device(serial: &str) -> DeviceConfig {
        DeviceConfig {
            serial: serial.to_string(),
            product_type: "438".to_string(),
            address: Some("192.168.1.20".to_string()),
            credential: Some("secret".to_string()),
            password: None,
            name: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.transport.port, 1883);
        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("airbridge.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [logging]
                level = "debug"

                [transport]
                connect_timeout_ms = 2500

                [[devices]]
                serial = "NK6-EU-MHA0000A"
                product_type = "438"
                address = "10.0.0.7"
                password = "abcdefgh"
                name = "Bedroom"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.transport.connect_timeout_ms, 2500);
        assert_eq!(config.transport.port, 1883);
        assert_eq!(config.devices.len(), 1);

        let device = config.device("NK6-EU-MHA0000A").unwrap();
        assert_eq!(device.display_name(), "Bedroom");
        assert_eq!(device.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(device.local_credential()?, hash_label_password("abcdefgh"));

        Ok(())
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/airbridge.toml")
            .build()
            .unwrap();
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = Config {
            devices: vec![device("A"), device("A")],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.reconnect.base_delay_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_credential() {
        let explicit = device("A");
        assert_eq!(explicit.local_credential().unwrap(), "secret");

        let mut neither = device("B");
        neither.credential = None;
        assert!(neither.local_credential().is_err());
    }

    #[test]
    fn test_hash_label_password() {
        let hash = hash_label_password("password");
        // SHA-512 digests are 64 bytes, 88 characters once base64 encoded
        assert_eq!(hash.len(), 88);
        assert!(hash.ends_with("=="));
        assert_eq!(hash, hash_label_password("password"));
        assert_ne!(hash, hash_label_password("Password"));
    }

    #[test]
    fn test_to_toml() {
        let config = Config {
            devices: vec![device("A")],
            ..Config::default()
        };
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[[devices]]"));
        assert!(rendered.contains("serial = \"A\""));
    }
}
