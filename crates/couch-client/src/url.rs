//! URL construction for database, document and `_changes` endpoints.

use reqwest::Url;

use crate::error::ConnectError;

/// Build the URL of a database from the server URL and the database name.
///
/// The database name is appended as a single, percent-encoded path segment,
/// so names containing `/` (allowed by CouchDB) are addressed correctly.
pub fn database_url(server_url: &str, database: &str) -> Result<Url, ConnectError> {
    let invalid = |reason: String| ConnectError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };

    let mut url = Url::parse(server_url.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| invalid("URL cannot be a base".to_string()))?
        .pop_if_empty()
        .push(database);
    Ok(url)
}

/// Append path segments (document id, `_changes`, ...) to a database URL.
pub fn join_segments(database_url: &Url, segments: &[&str]) -> Url {
    let mut url = database_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Feed styles understood by the `_changes` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Normal,
    Longpoll,
    Continuous,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::Longpoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// Query parameters of a `_changes` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesQuery {
    pub feed: FeedMode,
    /// `None` omits the parameter (the server then starts from the beginning).
    pub since: Option<String>,
    pub include_docs: bool,
    /// Milliseconds; only sent when non-zero.
    pub timeout_ms: u64,
    /// Only sent when non-zero.
    pub limit: u64,
    /// Milliseconds; only sent when non-zero.
    pub heartbeat_ms: u64,
    /// Only sent when non-zero.
    pub seq_interval: u64,
}

impl ChangesQuery {
    pub fn new(feed: FeedMode) -> Self {
        Self {
            feed,
            since: None,
            include_docs: false,
            timeout_ms: 0,
            limit: 0,
            heartbeat_ms: 0,
            seq_interval: 0,
        }
    }

    /// Query pairs in the order the server documents them.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("feed", self.feed.as_str().to_string())];
        if let Some(since) = &self.since {
            pairs.push(("since", since.clone()));
        }
        if self.include_docs {
            pairs.push(("include_docs", "true".to_string()));
        }
        if self.timeout_ms > 0 {
            pairs.push(("timeout", self.timeout_ms.to_string()));
        }
        if self.limit > 0 {
            pairs.push(("limit", self.limit.to_string()));
        }
        if self.heartbeat_ms > 0 {
            pairs.push(("heartbeat", self.heartbeat_ms.to_string()));
        }
        if self.seq_interval > 0 {
            pairs.push(("seq_interval", self.seq_interval.to_string()));
        }
        pairs
    }

    /// Full `_changes` URL for a database.
    pub fn url(&self, database_url: &Url) -> Url {
        let mut url = join_segments(database_url, &["_changes"]);
        url.query_pairs_mut().extend_pairs(self.pairs());
        url
    }
}
