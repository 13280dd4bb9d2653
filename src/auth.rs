//! Credential acquisition for the speech service
//!
//! Two providers are included: a constant subscription key (no I/O) and a
//! token-exchange provider that trades the key for a short-lived bearer token
//! over HTTPS. The session core calls `fetch` on the first dial of a
//! recognition and `fetch_on_expiry` when the service rejects the previous
//! credentials with a 403.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Mutex;
use std::time::Duration;

/// Header carrying a raw subscription key.
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Header carrying a bearer token.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Timeout for the token-exchange HTTP call.
const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved credentials: the header to set and its value.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub header_name: String,
    pub token: String,
}

/// Errors from credential acquisition
#[derive(Debug, Clone)]
pub enum AuthError {
    /// Network-level failure while fetching a token
    Fetch(String),
    /// The token endpoint answered with a non-success status
    Rejected { status: u16, message: String },
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Fetch(e) => write!(f, "Failed to fetch credentials: {}", e),
            AuthError::Rejected { status, message } => {
                write!(f, "Token endpoint rejected the request ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Source of connection credentials.
///
/// `auth_fetch_event_id` is an opaque 32-hex id minted by the caller for
/// correlating the fetch in telemetry; providers may ignore it.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Fetch credentials for a new connection.
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError>;

    /// Fetch fresh credentials after the service signaled expiry (403).
    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError>;
}

/// Constant subscription key, sent on every connection.
pub struct SubscriptionKeyAuth {
    key: String,
}

impl SubscriptionKeyAuth {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl AuthProvider for SubscriptionKeyAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        Ok(AuthInfo {
            header_name: SUBSCRIPTION_KEY_HEADER.to_string(),
            token: self.key.clone(),
        })
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        // Nothing to refresh; the key is all we have.
        self.fetch(auth_fetch_event_id).await
    }
}

/// Exchanges a subscription key for a bearer token at a token endpoint.
///
/// The token is cached until the service reports expiry, at which point
/// `fetch_on_expiry` discards it and performs a fresh exchange.
pub struct TokenExchangeAuth {
    client: Client,
    token_url: String,
    key: String,
    cached: Mutex<Option<String>>,
}

impl TokenExchangeAuth {
    pub fn new(token_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(TOKEN_FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            token_url: token_url.into(),
            key: key.into(),
            cached: Mutex::new(None),
        }
    }

    async fn exchange(&self) -> Result<String, AuthError> {
        log::debug!("Auth: exchanging subscription key at {}", self.token_url);

        let response = self
            .client
            .post(&self.token_url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.key)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| AuthError::Fetch(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Fetch(e.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl AuthProvider for TokenExchangeAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        if let Some(token) = self.cached.lock().unwrap().clone() {
            return Ok(AuthInfo {
                header_name: AUTHORIZATION_HEADER.to_string(),
                token,
            });
        }

        let token = format!("Bearer {}", self.exchange().await?);
        *self.cached.lock().unwrap() = Some(token.clone());

        Ok(AuthInfo {
            header_name: AUTHORIZATION_HEADER.to_string(),
            token,
        })
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        log::info!("Auth: credentials expired, discarding cached token");
        self.cached.lock().unwrap().take();
        self.fetch(auth_fetch_event_id).await
    }
}
