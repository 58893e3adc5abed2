//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Serving host used in handles (e.g., "media.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the node
    ///
    /// # Returns
    /// Full URL like "https://media.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Whether `host` names this node.
    pub fn is_local_host(&self, host: &str) -> bool {
        normalize_host(host) == normalize_host(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Connect/read timeout for every outbound request
    pub http_timeout_secs: u64,
    /// User-Agent sent to remote servers
    pub user_agent: String,
    /// Name announced when registering as a client with a remote server
    pub application_name: String,
    /// Secret used to mint and verify dialback tokens (32+ bytes)
    pub dialback_secret: String,
}

impl FederationConfig {
    /// Outbound request timeout; `None` when `http_timeout_secs` is 0
    pub fn http_timeout(&self) -> Option<Duration> {
        (self.http_timeout_secs > 0).then(|| Duration::from_secs(self.http_timeout_secs))
    }
}

/// Worker pool and retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Total attempts per job, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_backoff_ms: u64,
    /// Maximum backoff delay (milliseconds)
    pub max_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDISPATCH__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedispatch.db")?
            .set_default("federation.http_timeout_secs", 10)?
            .set_default(
                "federation.user_agent",
                concat!("fedispatch/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("federation.application_name", "fedispatch")?
            .set_default("queue.workers", 4)?
            .set_default("queue.max_attempts", 5)?
            .set_default("queue.base_backoff_ms", 1000)?
            .set_default("queue.max_backoff_ms", 60000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_DIALBACK_SECRET_BYTES: usize = 32;

        if self.federation.dialback_secret.len() < MIN_DIALBACK_SECRET_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "federation.dialback_secret must be at least {} bytes",
                MIN_DIALBACK_SECRET_BYTES
            )));
        }

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.queue.workers == 0 {
            return Err(crate::error::AppError::Config(
                "queue.workers must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "queue.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.http_timeout_secs == 0 {
            tracing::warn!("federation.http_timeout_secs=0 disables outbound request timeouts");
        }

        Ok(())
    }
}

/// Lower-case a host and drop a trailing root dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
