//! Error types for the couch-client crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that abort the start of a session.
///
/// Every variant is fatal to the owning session; callers must not keep
/// using a configuration that failed to connect.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Database endpoint unreachable: {0}")]
    Unreachable(#[source] TransportError),

    #[error("Credentials rejected by server (HTTP {0})")]
    Unauthorized(u16),

    #[error("Database '{0}' does not exist")]
    DatabaseNotFound(String),

    #[error("Unexpected HTTP status {status} while connecting: {reason}")]
    UnexpectedStatus { status: u16, reason: String },
}

/// Errors raised while sending a single request.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Session is disconnected")]
    Disconnected,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Failed to obtain access token: {0}")]
    Token(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
