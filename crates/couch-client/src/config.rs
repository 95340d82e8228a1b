//! Client configuration.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::duration::{parse_duration_to_secs, parse_interval_to_millis};
use crate::error::ConnectError;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HEARTBEAT_MS: u64 = 2000;
const DEFAULT_MAX_CONNECTIONS: usize = 6;

/// Connection settings for one database.
///
/// The struct can be filled from command-line flags / environment variables
/// (`#[command(flatten)]` it into a clap parser) or deserialized from a
/// config file. It is immutable once a session has been built from it;
/// changing it requires a fresh connect.
#[derive(Args, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    /// Server URL, e.g. https://account.cloudant.com
    #[arg(long = "couch-url", env = "COUCH_URL")]
    pub url: String,

    /// User name
    #[arg(long = "couch-username", env = "COUCH_USERNAME")]
    pub username: String,

    /// Password (HTTP Basic authentication)
    #[arg(long = "couch-password", env = "COUCH_PASSWORD")]
    #[serde(default)]
    pub password: Option<String>,

    /// API key, exchanged for a short-lived bearer token
    #[arg(long = "couch-api-key", env = "COUCH_API_KEY")]
    #[serde(default)]
    pub api_key: Option<String>,

    /// Database name
    #[arg(long = "couch-database", env = "COUCH_DATABASE")]
    pub database: String,

    /// Connect timeout in seconds ("300", "30s", "5m")
    #[arg(long, default_value = "300", value_parser = parse_duration_to_secs)]
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds ("300", "30s", "5m")
    #[arg(long, default_value = "300", value_parser = parse_duration_to_secs)]
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Maximum number of pooled connections per host
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Heartbeat interval of the changes feed in milliseconds
    #[arg(long, default_value = "2000", value_parser = parse_interval_to_millis)]
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Accept invalid TLS certificates (testing only)
    #[arg(long)]
    #[serde(default)]
    pub disable_tls_verification: bool,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_MS
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: None,
            api_key: None,
            database: String::new(),
            connect_timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            disable_tls_verification: false,
        }
    }
}

impl Configuration {
    /// Configuration with password authentication and default timeouts.
    pub fn with_password(url: &str, username: &str, password: &str, database: &str) -> Self {
        Self {
            url: url.to_string(),
            username: username.to_string(),
            password: Some(password.to_string()),
            database: database.to_string(),
            ..Self::default()
        }
    }

    /// Check that everything needed to connect is present.
    ///
    /// Requires a URL, a user name, a database name and either a password
    /// or an API key.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.url.trim().is_empty() {
            return Err(ConnectError::InvalidConfig("url is empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ConnectError::InvalidConfig("username is empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(ConnectError::InvalidConfig(
                "database name is empty".to_string(),
            ));
        }
        if is_blank(&self.password) && is_blank(&self.api_key) {
            return Err(ConnectError::InvalidConfig(
                "either a password or an API key is required".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConnectError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// True when requests authenticate with a bearer token obtained for the API key.
    pub fn uses_api_key(&self) -> bool {
        !is_blank(&self.api_key)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::is_empty).unwrap_or(true)
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("max_connections", &self.max_connections)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("disable_tls_verification", &self.disable_tls_verification)
            .finish()
    }
}
