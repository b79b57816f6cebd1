//! Hub Configuration Settings
//!
//! Configuration types for the market data hub, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::services::DistributorConfig;

/// Which adapters back the data access layer and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// PostgreSQL for durable storage, Redis for cache and pub/sub.
    #[default]
    External,
    /// In-process adapters. Nothing survives a restart.
    Memory,
}

impl Backend {
    /// Parse backend from string. Unknown values select `External`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Self::Memory,
            _ => Self::External,
        }
    }

    /// Get the backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Memory => "memory",
        }
    }
}

/// Durable store (PostgreSQL) connection settings.
#[derive(Clone)]
pub struct StoreSettings {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database user.
    pub user: String,
    password: String,
    /// Database name.
    pub database: String,
    /// Connection pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl StoreSettings {
    /// Replace the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "dse_trading".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// Cache and pub/sub (Redis) connection settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
}

impl CacheSettings {
    /// Connection URL for the Redis client.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Distributor settings.
#[derive(Debug, Clone, Copy)]
pub struct DistributorSettings {
    /// Ticks buffered per tick stream.
    pub stream_capacity: usize,
}

impl Default for DistributorSettings {
    fn default() -> Self {
        Self {
            stream_capacity: DistributorConfig::default().stream_capacity,
        }
    }
}

impl From<DistributorSettings> for DistributorConfig {
    fn from(settings: DistributorSettings) -> Self {
        Self {
            stream_capacity: settings.stream_capacity,
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Adapter selection.
    pub backend: Backend,
    /// Durable store settings.
    pub store: StoreSettings,
    /// Cache and transport settings.
    pub cache: CacheSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Distributor settings.
    pub distributor: DistributorSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// Every variable is optional and falls back to a local default.
    ///
    /// # Errors
    ///
    /// Returns an error if a host or database name is set but empty, or the
    /// pool size or stream capacity is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = std::env::var("MARKET_DATA_BACKEND")
            .map(|s| Backend::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let defaults = StoreSettings::default();
        let store = StoreSettings {
            host: parse_env_string("DB_HOST", &defaults.host)?,
            port: parse_env_u16("DB_PORT", defaults.port),
            user: parse_env_string("DB_USER", &defaults.user)?,
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            database: parse_env_string("DB_NAME", &defaults.database)?,
            max_connections: parse_env_u32("DB_MAX_CONNECTIONS", defaults.max_connections),
            acquire_timeout: parse_env_duration_secs(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout,
            ),
        };

        if store.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DB_MAX_CONNECTIONS".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }

        let cache = CacheSettings {
            host: parse_env_string("REDIS_HOST", &CacheSettings::default().host)?,
            port: parse_env_u16("REDIS_PORT", CacheSettings::default().port),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                "MARKET_DATA_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let distributor = DistributorSettings {
            stream_capacity: parse_env_usize(
                "MARKET_DATA_STREAM_CAPACITY",
                DistributorSettings::default().stream_capacity,
            ),
        };

        if distributor.stream_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_DATA_STREAM_CAPACITY".to_string(),
                message: "stream capacity must be at least 1".to_string(),
            });
        }

        Ok(Self {
            backend,
            store,
            cache,
            server,
            distributor,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

fn parse_env_string(key: &str, default: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Ok(value) => Ok(value),
        Err(_) => Ok(default.to_string()),
    }
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("memory", Backend::Memory)]
    #[test_case("MEMORY", Backend::Memory)]
    #[test_case("in-memory", Backend::Memory)]
    #[test_case("external", Backend::External)]
    #[test_case("unknown", Backend::External)]
    fn backend_parsing(input: &str, expected: Backend) {
        assert_eq!(Backend::from_str_case_insensitive(input), expected);
    }

    #[test]
    fn store_password_redacted_debug() {
        let settings = StoreSettings::default().with_password("hunter2");
        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(settings.password(), "hunter2");
    }

    #[test]
    fn store_settings_defaults() {
        let settings = StoreSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.user, "postgres");
        assert_eq!(settings.password(), "");
        assert_eq!(settings.database, "dse_trading");
        assert_eq!(settings.max_connections, 10);
    }

    #[test]
    fn cache_settings_url() {
        let settings = CacheSettings::default();
        assert_eq!(settings.url(), "redis://localhost:6379/");
    }

    #[test]
    fn server_settings_defaults() {
        assert_eq!(ServerSettings::default().health_port, 8083);
    }

    #[test]
    fn distributor_settings_convert_to_config() {
        let settings = DistributorSettings { stream_capacity: 64 };
        assert_eq!(DistributorConfig::from(settings).stream_capacity, 64);
        assert_eq!(
            DistributorConfig::from(DistributorSettings::default()),
            DistributorConfig::default()
        );
    }

    #[test]
    fn default_backend_is_external() {
        assert_eq!(HubConfig::default().backend, Backend::External);
    }
}
