//! Transport trait and HTTP response classification.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

/// A buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Coarse classification of a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Conflict,
    ClientError,
    ServerError,
    Unexpected,
}

/// Error body returned by the server: `{"error": "conflict", "reason": "..."}`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    /// Human readable description of a failed response.
    pub fn error_reason(&self) -> String {
        let parsed: ErrorBody = self.json().unwrap_or_default();
        match (parsed.error, parsed.reason) {
            (Some(error), Some(reason)) => format!("HTTP {}: {error}: {reason}", self.status),
            (Some(error), None) => format!("HTTP {}: {error}", self.status),
            (None, Some(reason)) => format!("HTTP {}: {reason}", self.status),
            (None, None) if self.body.trim().is_empty() => format!("HTTP {}", self.status),
            (None, None) => format!("HTTP {}: {}", self.status, self.body.trim()),
        }
    }
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            404 => StatusClass::NotFound,
            409 => StatusClass::Conflict,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unexpected,
        }
    }
}

/// Request/response access to one database.
///
/// Paths are given as segments relative to the database URL
/// (`&["doc-id"]`, `&[]` for the database itself); implementations take
/// care of encoding. Failures to get any response at all are reported as
/// [`TransportError`](crate::TransportError); every HTTP status, including
/// errors, comes back as an [`HttpResponse`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the database this transport talks to.
    fn database(&self) -> &str;

    async fn get(&self, path: &[&str], query: &[(&str, String)]) -> Result<HttpResponse>;

    async fn put(&self, path: &[&str], body: &Value) -> Result<HttpResponse>;

    async fn post(&self, path: &[&str], body: &Value) -> Result<HttpResponse>;
}
