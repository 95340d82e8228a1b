//! HTTP session against a CouchDB-compatible server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::{Credentials, TokenProvider};
use crate::config::Configuration;
use crate::error::{ConnectError, Result, TransportError};
use crate::transport::{HttpResponse, StatusClass, Transport};
use crate::url::{database_url, join_segments, ChangesQuery};

/// Build a `reqwest` client honouring the connection settings.
///
/// No overall request timeout is set on the client: streaming feed
/// requests stay open indefinitely and per-request timeouts are applied by
/// the callers instead.
pub fn build_http_client(config: &Configuration) -> std::result::Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .pool_max_idle_per_host(config.max_connections)
        .danger_accept_invalid_certs(config.disable_tls_verification)
        .build()
}

/// An authenticated, pooled connection to one database.
///
/// Created by [`HttpSession::connect`], which validates the configuration
/// and checks the database before handing out the session.
pub struct HttpSession {
    config: Configuration,
    database_url: Url,
    credentials: Credentials,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpSession {
    /// Connect with HTTP Basic authentication.
    pub async fn connect(config: Configuration) -> std::result::Result<Self, ConnectError> {
        Self::connect_inner(config, None).await
    }

    /// Connect with an API key, using `provider` to obtain bearer tokens.
    /// Falls back to Basic authentication when no API key is configured.
    pub async fn connect_with_token_provider(
        config: Configuration,
        provider: Arc<dyn TokenProvider>,
    ) -> std::result::Result<Self, ConnectError> {
        Self::connect_inner(config, Some(provider)).await
    }

    async fn connect_inner(
        config: Configuration,
        provider: Option<Arc<dyn TokenProvider>>,
    ) -> std::result::Result<Self, ConnectError> {
        config.validate()?;
        let database_url = database_url(&config.url, &config.database)?;
        let credentials = Credentials::from_config(&config, provider)?;
        let client = build_http_client(&config).map_err(ConnectError::Client)?;

        let session = Self {
            config,
            database_url,
            credentials,
            client: RwLock::new(Some(client)),
        };

        // Check the database so broken URLs, credentials or names fail here
        // instead of on the first document operation.
        let check = session
            .send(Method::GET, &[], &[], None, session.config.read_timeout())
            .await
            .map_err(ConnectError::Unreachable)?;
        match check.class() {
            StatusClass::Success => {}
            StatusClass::NotFound => {
                return Err(ConnectError::DatabaseNotFound(session.config.database.clone()))
            }
            _ if check.status == 401 || check.status == 403 => {
                return Err(ConnectError::Unauthorized(check.status))
            }
            _ => {
                return Err(ConnectError::UnexpectedStatus {
                    status: check.status,
                    reason: check.error_reason(),
                })
            }
        }

        info!(
            "Connected to database '{}' at {}",
            session.config.database, session.database_url
        );
        Ok(session)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn database_url(&self) -> &Url {
        &self.database_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Release pooled connections. Safe to call more than once; requests
    /// issued afterwards fail with [`TransportError::Disconnected`].
    pub async fn disconnect(&self) {
        if self.client.write().await.take().is_some() {
            debug!("Disconnected client for database '{}'", self.config.database);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Handle to the pooled client; cheap to clone.
    pub async fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(TransportError::Disconnected)
    }

    /// Issue a `_changes` request and buffer the response.
    ///
    /// `timeout` bounds the whole request, which for long-polling feeds has
    /// to exceed the server-side `timeout` parameter.
    pub async fn get_changes(&self, query: &ChangesQuery, timeout: Duration) -> Result<HttpResponse> {
        let url = query.url(&self.database_url);
        self.execute(Method::GET, url, None, timeout).await
    }

    async fn send(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let mut url = join_segments(&self.database_url, path);
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        self.execute(method, url, body, timeout).await
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let client = self.client().await?;
        let mut request = client.request(method.clone(), url.clone()).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let request = self.credentials.apply(request).await?;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Request(e)
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 500 {
            warn!("{method} {url} returned HTTP {status}");
        } else {
            debug!("{method} {url} returned HTTP {status}");
        }
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpSession {
    fn database(&self) -> &str {
        &self.config.database
    }

    async fn get(&self, path: &[&str], query: &[(&str, String)]) -> Result<HttpResponse> {
        self.send(Method::GET, path, query, None, self.config.read_timeout())
            .await
    }

    async fn put(&self, path: &[&str], body: &Value) -> Result<HttpResponse> {
        self.send(Method::PUT, path, &[], Some(body), self.config.read_timeout())
            .await
    }

    async fn post(&self, path: &[&str], body: &Value) -> Result<HttpResponse> {
        self.send(Method::POST, path, &[], Some(body), self.config.read_timeout())
            .await
    }
}
