//! Request authentication.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Configuration;
use crate::error::{ConnectError, TransportError};

/// Exchanges an API key for a short-lived bearer token.
///
/// The exchange itself (an IAM endpoint, a vault, ...) is owned by the
/// embedding application; the session asks for a token before each request
/// so the provider can cache and refresh as it sees fit.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, api_key: &str) -> anyhow::Result<String>;
}

/// How requests are authenticated.
#[derive(Clone)]
pub enum Credentials {
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        api_key: String,
        provider: Arc<dyn TokenProvider>,
    },
}

impl Credentials {
    /// Pick the credentials for a configuration.
    ///
    /// An API key takes precedence over a password and needs a token provider.
    pub fn from_config(
        config: &Configuration,
        provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self, ConnectError> {
        if config.uses_api_key() {
            let provider = provider.ok_or_else(|| {
                ConnectError::InvalidConfig(
                    "an API key is configured but no token provider was supplied".to_string(),
                )
            })?;
            return Ok(Credentials::Bearer {
                api_key: config.api_key.clone().unwrap_or_default(),
                provider,
            });
        }
        Self::basic_from_config(config)
    }

    /// Basic credentials only; fails when the configuration has no password.
    pub fn basic_from_config(config: &Configuration) -> Result<Self, ConnectError> {
        match config.password.as_deref() {
            Some(password) if !password.is_empty() => Ok(Credentials::Basic {
                username: config.username.clone(),
                password: password.to_string(),
            }),
            _ => Err(ConnectError::InvalidConfig(
                "HTTP Basic authentication requires a password".to_string(),
            )),
        }
    }

    /// Attach the credentials to a request.
    pub async fn apply(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        match self {
            Credentials::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            Credentials::Bearer { api_key, provider } => {
                let token = provider
                    .access_token(api_key)
                    .await
                    .map_err(|e| TransportError::Token(e.to_string()))?;
                Ok(request.bearer_auth(token))
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Bearer { .. } => f.debug_struct("Bearer").finish_non_exhaustive(),
        }
    }
}
