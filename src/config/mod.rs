//! Server configuration loaded from TOML.
//!
//! ```toml
//! bind = ["127.0.0.1:8080", "[::1]:8080"]
//! ignore_case = true
//! max_request_size = 1048576
//! read_timeout_secs = 10
//! ```
//!
//! Every key is optional; missing keys take the [`ServerConfig::default`]
//! values.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::listener::{DEFAULT_MAX_REQUEST_SIZE, DEFAULT_READ_TIMEOUT};

const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings consumed by [`Server::from_config`](crate::Server::from_config).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Addresses to listen on, `host:port`. Port `0` picks a free port.
    pub bind: Vec<String>,
    /// Match literal path segments case-insensitively.
    pub ignore_case: bool,
    /// Largest request, head plus body, in bytes.
    pub max_request_size: usize,
    /// Seconds a client gets to send one complete request before a `408`.
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: vec![DEFAULT_BIND.to_owned()],
            ignore_case: false,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    /// [`read_timeout_secs`](Self::read_timeout_secs) as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// As [`from_toml_str`](Self::from_toml_str), plus [`ConfigError::Io`]
    /// when the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `bind` is empty or holds a blank entry, or
    /// if `max_request_size` or `read_timeout_secs` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.is_empty() {
            return Err(ConfigError::Invalid("`bind` must list at least one address".into()));
        }
        if let Some(blank) = self.bind.iter().position(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("`bind[{blank}]` is empty")));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("`max_request_size` must be greater than zero".into()));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("`read_timeout_secs` must be greater than zero".into()));
        }
        Ok(())
    }
}
