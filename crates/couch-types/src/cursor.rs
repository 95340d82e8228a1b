//! Resume position for the `_changes` feed.

use serde::{Deserialize, Serialize};

/// Where a changes feed session starts.
///
/// The server defines the ordering of tokens; the client only hands them
/// back as the `since` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Cursor {
    /// Replay the whole history (`since` absent or `0`).
    #[default]
    Beginning,
    /// Only changes made after the feed is opened.
    Now,
    /// An opaque token previously returned by the server.
    Token(String),
}

impl Cursor {
    const BEGINNING: &'static str = "0";
    const NOW: &'static str = "now";

    /// Interpret a stored or user supplied token.
    ///
    /// Empty strings and `"0"` mean the beginning, `"now"` means the tip.
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "" | Self::BEGINNING => Cursor::Beginning,
            Self::NOW => Cursor::Now,
            other => Cursor::Token(other.to_string()),
        }
    }

    /// Like [`Cursor::from_token`], mapping `None` to the beginning.
    pub fn from_optional(token: Option<&str>) -> Self {
        token.map(Self::from_token).unwrap_or_default()
    }

    /// The string persisted in a checkpoint document.
    pub fn as_str(&self) -> &str {
        match self {
            Cursor::Beginning => Self::BEGINNING,
            Cursor::Now => Self::NOW,
            Cursor::Token(token) => token,
        }
    }

    /// The `since` query value, or `None` when the parameter should be omitted.
    pub fn since_param(&self) -> Option<&str> {
        match self {
            Cursor::Beginning => None,
            other => Some(other.as_str()),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Cursor::from_token(&s)
    }
}

impl From<Cursor> for String {
    fn from(c: Cursor) -> Self {
        c.as_str().to_string()
    }
}
