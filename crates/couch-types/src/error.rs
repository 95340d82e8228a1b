//! Error types for couch-types crate.

use thiserror::Error;

/// Errors raised while decoding JSON documents and feed entries.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Result type alias for couch-types operations.
pub type Result<T> = std::result::Result<T, CodecError>;
