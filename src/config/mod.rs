//! Application configuration loading and validation.
//!
//! One TOML file feeds every component:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [transport]
//! host = "mqtt.local"
//!
//! [topics]
//! measurement = "sensores/medicao"
//!
//! [consumer]
//! stop_timeout = 5
//!
//! [registry]
//! backend = "sqlite"
//! path = "/var/lib/greenbee/registry.db"
//!
//! [device]
//! name = "esp32_sim"
//! ```
//!
//! Every table is optional and falls back to its defaults. The configuration
//! is loaded once at startup and treated as immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    consumer::ConsumerConfig, device::DeviceConfig, logger::LoggerConfig,
    registry::RegistryConfig, topics::TopicsConfig,
};

pub mod consumer;
pub mod device;
pub mod logger;
pub mod registry;
pub mod topics;

pub type TransportConfig = greenbee_mqtt::Config;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "GREENBEE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/greenbee/config.toml";

/// Timestamp used by the `print_*` macros, which run before tracing is set up.
#[doc(hidden)]
pub fn console_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Prints an `INFO` line to stdout without going through tracing.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

/// Like [`print_info!`] but on stderr, for failures before the logger exists.
#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Why the configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No usable configuration file was found.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The file exists but could not be read.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid TOML or does not match the expected tables.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// A value is outside its allowed range; the message lists every
    /// offending field.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// `[logger]`: level, console format and journald output.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// `[transport]`: broker address, QoS and reconnect policy.
    #[validate(nested)]
    pub transport: TransportConfig,

    /// `[topics]`: protocol topic names shared by server and devices.
    #[validate(nested)]
    pub topics: TopicsConfig,

    /// `[consumer]`: stop timeout, identity retries and placeholder SoC.
    #[validate(nested)]
    pub consumer: ConsumerConfig,

    /// `[registry]`: storage backend and database path.
    #[validate(nested)]
    pub registry: RegistryConfig,

    /// `[device]`: timings of the simulated sensor.
    #[validate(nested)]
    pub device: DeviceConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::get_config_path()?;
        Self::load(&path)
    }

    /// Priority: `GREENBEE_CONFIG`, then `/etc/greenbee/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found (set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH})"
        )))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "File not found: {}",
                path.display()
            )));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::registry::RegistryBackend;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.topics.measurement, "sensores/medicao");
        assert_eq!(config.consumer.stop_timeout, 5);
        assert_eq!(config.registry.backend, RegistryBackend::Memory);
        assert_eq!(config.transport.port, 1883);
    }

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logger]
level = "debug"

[transport]
host = "broker.estufa"
port = 1884
client_id = "greenbee-01"

[topics]
status = "estufa/status"

[consumer]
stop_timeout = 2
identity_attempts = 0

[registry]
backend = "sqlite"
path = "/tmp/registry.db"

[device]
name = "esp32_a"
measurement_interval = 30
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.transport.host, "broker.estufa");
        assert_eq!(config.transport.client_id, "greenbee-01");
        assert_eq!(config.topics.status, "estufa/status");
        assert_eq!(config.topics.unbind, "sensores/bind/unbind");
        assert_eq!(config.consumer.identity_attempts, 0);
        assert_eq!(config.registry.backend, RegistryBackend::Sqlite);
        assert_eq!(config.device.name, "esp32_a");
        assert_eq!(config.device.measurement_interval, 30);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = Config::from_toml("[transport\nhost=");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_nested_validation_error() {
        let result = Config::from_toml("[transport]\nport = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_console_timestamp_shape() {
        let ts = console_timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2025-01-01T00:00:00.000000Z".len());
    }
}
