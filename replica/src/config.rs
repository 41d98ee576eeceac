//! Configuration management for a replica node.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Replica configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
    /// SQLite connection URL for the event store
    pub database_url: String,
    /// Human readable device name advertised to peers
    pub device_name: String,
    /// Cloud backend base URL; cloud sync is disabled when absent
    pub sync_url: Option<String>,
    /// Bearer token, also the sync identity
    pub auth_token: Option<String>,
    pub sync_interval: Duration,
    /// Events pushed per request
    pub sync_batch_size: usize,
    /// Events pulled per request
    pub pull_limit: usize,
    pub request_timeout: Duration,
    /// TCP port the peer listener binds
    pub peer_port: u16,
    /// UDP port for discovery beacons
    pub discovery_port: u16,
    pub peer_sync_interval: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://shelf.db".to_string(),
            device_name: default_device_name(),
            sync_url: None,
            auth_token: None,
            sync_interval: Duration::from_secs(300),
            sync_batch_size: 100,
            pull_limit: 500,
            request_timeout: Duration::from_secs(30),
            peer_port: 47600,
            discovery_port: 47601,
            peer_sync_interval: Duration::from_secs(60),
        }
    }
}

impl ReplicaConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var(name)?.map_or(default, Duration::from_secs))
        };

        Ok(Self {
            database_url: env::var("SHELF_DATABASE_URL").unwrap_or(defaults.database_url),
            device_name: env::var("SHELF_DEVICE_NAME").unwrap_or(defaults.device_name),
            sync_url: non_empty_var("SHELF_SYNC_URL"),
            auth_token: non_empty_var("SHELF_AUTH_TOKEN"),
            sync_interval: secs("SHELF_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            sync_batch_size: positive(
                "SHELF_SYNC_BATCH_SIZE",
                parse_var("SHELF_SYNC_BATCH_SIZE")?.unwrap_or(defaults.sync_batch_size),
            )?,
            pull_limit: positive(
                "SHELF_PULL_LIMIT",
                parse_var("SHELF_PULL_LIMIT")?.unwrap_or(defaults.pull_limit),
            )?,
            request_timeout: secs("SHELF_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            peer_port: parse_var("SHELF_PEER_PORT")?.unwrap_or(defaults.peer_port),
            discovery_port: parse_var("SHELF_DISCOVERY_PORT")?.unwrap_or(defaults.discovery_port),
            peer_sync_interval: secs("SHELF_PEER_SYNC_INTERVAL_SECS", defaults.peer_sync_interval)?,
        })
    }

    /// Address the peer listener binds.
    pub fn peer_listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.peer_port))
    }
}

fn default_device_name() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| format!("shelf-{}", env::consts::OS))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(None),
    }
}

fn positive(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplicaConfig::default();
        assert_eq!(config.database_url, "sqlite://shelf.db");
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.sync_batch_size, 100);
        assert_eq!(config.pull_limit, 500);
        assert_eq!(config.peer_port, 47600);
        assert_eq!(config.discovery_port, 47601);
        assert!(config.sync_url.is_none());
    }

    #[test]
    fn zero_batch_is_rejected() {
        assert!(matches!(
            positive("SHELF_SYNC_BATCH_SIZE", 0),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(positive("SHELF_PULL_LIMIT", 7).unwrap(), 7);
    }
}
