//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Shared secret every bearer token must carry as `identity:secret`
    pub auth_secret: Option<String>,
    /// Largest accepted push batch
    pub max_push_batch: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let max_push_batch = match env::var("MAX_PUSH_BATCH") {
            Ok(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidBatch(raw))?,
            Err(_) => DEFAULT_MAX_PUSH_BATCH,
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_push_batch,
        })
    }

    /// A configuration for tests and local tooling.
    pub fn local(database_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: database_url.into(),
            auth_secret: None,
            max_push_batch: DEFAULT_MAX_PUSH_BATCH,
        }
    }
}

pub const DEFAULT_MAX_PUSH_BATCH: usize = 1000;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid MAX_PUSH_BATCH value: {0}")]
    InvalidBatch(String),
}
