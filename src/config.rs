//! Backbone configuration.
//!
//! Read once per [`ResourceContext`](crate::ResourceContext) construction.
//! Every section has defaults, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cache pool configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Document store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that have no meaningful fallback.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "cache.servers must name at least one host".to_string(),
            ));
        }
        if self.cache.replicas == 0 {
            return Err(ConfigError::Invalid(
                "cache.replicas must be positive".to_string(),
            ));
        }
        if self.store.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "store.chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache server addresses, `"host"` or `"host:port"`.
    #[serde(default = "CacheConfig::default_servers")]
    pub servers: Vec<String>,

    /// Virtual nodes per server on the hash ring.
    #[serde(default = "CacheConfig::default_replicas")]
    pub replicas: usize,

    /// Socket timeout in milliseconds, applied to connect, read and write.
    #[serde(default = "CacheConfig::default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            servers: Self::default_servers(),
            replicas: Self::default_replicas(),
            socket_timeout_ms: Self::default_socket_timeout_ms(),
        }
    }
}

impl CacheConfig {
    fn default_servers() -> Vec<String> {
        vec!["localhost".to_string()]
    }

    fn default_replicas() -> usize {
        crate::ring::DEFAULT_REPLICAS
    }

    fn default_socket_timeout_ms() -> u64 {
        10_000
    }

    /// The socket timeout as a duration.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store location: a directory holding one database file per database
    /// name, or `:memory:` for a store that lives as long as its context.
    #[serde(default = "StoreConfig::default_host")]
    pub host: String,

    /// Database used when a caller does not name one.
    #[serde(default = "StoreConfig::default_database")]
    pub database: String,

    /// Database holding the file store tables.
    #[serde(default = "StoreConfig::default_files_database")]
    pub files_database: String,

    /// Maximum bytes per stored chunk.
    #[serde(default = "StoreConfig::default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            database: Self::default_database(),
            files_database: Self::default_files_database(),
            chunk_size: Self::default_chunk_size(),
        }
    }
}

impl StoreConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_database() -> String {
        "test".to_string()
    }

    fn default_files_database() -> String {
        "test_fs".to_string()
    }

    fn default_chunk_size() -> usize {
        255 * 1024
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
