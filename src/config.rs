//! Ambient configuration for the naming and coordination services.

use std::time::Duration;

use serde::Deserialize;

/// Result of configuration loading with error type [`ConfigError`].
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML text cannot be deserialized.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration file cannot be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Timeouts and intervals of the coordination services. Every field has
/// the service's built-in default, so a partial (or absent) TOML file is
/// fine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DfsConfig {
    /// Store connect timeout, milliseconds.
    pub store_connect_timeout_ms: u64,
    /// Standard store lock timeout, milliseconds.
    pub lock_timeout_ms: u64,
    /// Paged result cache TTL, milliseconds.
    pub page_cache_ttl_ms: u64,
    /// Minimum interval between redirection table reloads, milliseconds.
    pub redirection_reload_ms: u64,
    /// First mutex ownership poll, milliseconds.
    pub lock_first_poll_ms: u64,
    /// Later mutex ownership polls, milliseconds.
    pub lock_poll_ms: u64,
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self {
            store_connect_timeout_ms: crate::store::STORE_CONNECT_TIMEOUT.as_millis() as u64,
            lock_timeout_ms: crate::store::SDS_LOCK_TIMEOUT.as_millis() as u64,
            page_cache_ttl_ms: crate::paged::PAGE_CACHE_TTL.as_millis() as u64,
            redirection_reload_ms: crate::redirect::MIN_REDIRECTION_LOAD_INTERVAL.as_millis()
                as u64,
            lock_first_poll_ms: crate::dmutex::LOCK_POLL_FIRST.as_millis() as u64,
            lock_poll_ms: crate::dmutex::LOCK_POLL.as_millis() as u64,
        }
    }
}

impl DfsConfig {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Store connect timeout.
    pub fn store_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.store_connect_timeout_ms)
    }

    /// Standard store lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Paged result cache TTL.
    pub fn page_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.page_cache_ttl_ms)
    }

    /// Minimum interval between redirection reloads.
    pub fn redirection_reload(&self) -> Duration {
        Duration::from_millis(self.redirection_reload_ms)
    }

    /// First mutex ownership poll.
    pub fn lock_first_poll(&self) -> Duration {
        Duration::from_millis(self.lock_first_poll_ms)
    }

    /// Later mutex ownership polls.
    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }
}
