//! API client for the CyberArk PasswordVault REST API.
//!
//! Only the calls needed to hold a session open live here. Everything the
//! session and keepalive code needs from the network goes through the
//! [`SessionApi`] and [`SshKeySource`] traits so it can be stubbed in tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::Token;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Path prefix shared by every PasswordVault REST endpoint
const API_PATH: &str = "/PasswordVault/API";

/// HTTP request timeout in seconds.
/// A hung call must never wedge the keepalive loop.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Key format requested from the MFA-caching endpoint
const SSH_KEY_FORMAT: &str = "OpenSSH";

#[derive(Debug, Serialize)]
struct LogonRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(rename = "concurrentSession")]
    concurrent_session: bool,
}

#[derive(Debug, Serialize)]
struct SshKeyRequest<'a> {
    #[serde(rename = "keyPassword")]
    key_password: &'a str,
    formats: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct SshKeyResponse {
    #[serde(default)]
    value: Vec<SshKeyEntry>,
}

#[derive(Debug, Deserialize)]
struct SshKeyEntry {
    format: Option<String>,
    #[serde(rename = "privateKey")]
    private_key: Option<String>,
}

/// Session-level operations against the vault.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// RADIUS logon. Returns the new session token.
    async fn logon(&self, username: &str, password: &str) -> Result<Token, ApiError>;

    /// Cheap authenticated request. `false` on any failure, never an error.
    async fn probe(&self, token: &Token) -> bool;

    /// Invalidate the token server-side.
    async fn logoff(&self, token: &Token) -> Result<(), ApiError>;
}

/// Source of MFA-caching SSH private keys.
#[async_trait]
pub trait SshKeySource: Send + Sync {
    async fn fetch_ssh_key(&self) -> Result<Option<String>, ApiError>;
}

/// API client for PasswordVault.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<Token>,
}

impl ApiClient {
    /// Create a client for `endpoint`, a bare host name (`cyberark`) or a
    /// full base URL (`http://127.0.0.1:8080`).
    pub fn new(endpoint: &str, verify_ssl: bool) -> Result<Self, ApiError> {
        Self::with_timeout(endpoint, verify_ssl, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Like [`new`](Self::new) with a custom per-request timeout
    pub fn with_timeout(
        endpoint: &str,
        verify_ssl: bool,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        if !verify_ssl {
            debug!(endpoint, "TLS certificate verification disabled");
        }

        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: Self::base_url_for(endpoint),
            token: None,
        })
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: Token) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    fn base_url_for(endpoint: &str) -> String {
        let trimmed = endpoint.trim().trim_end_matches('/');
        if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PATH, path)
    }

    fn auth_value(token: &Token) -> Result<header::HeaderValue, ApiError> {
        let mut value = header::HeaderValue::from_str(token.as_str()).map_err(|_| {
            ApiError::InvalidResponse("Token contains characters not allowed in a header".to_string())
        })?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// The logon endpoint answers with the token as a JSON string literal.
    fn parse_logon_token(body: &str) -> Result<Token, ApiError> {
        let trimmed = body.trim();
        let raw = if trimmed.starts_with('"') {
            serde_json::from_str::<String>(trimmed).map_err(|e| {
                ApiError::InvalidResponse(format!("Malformed logon token: {}", e))
            })?
        } else {
            trimmed.to_string()
        };

        Token::new(raw).ok_or_else(|| ApiError::InvalidResponse("Empty logon token".to_string()))
    }

    fn parse_ssh_key(body: &str) -> Result<Option<String>, ApiError> {
        let response: SshKeyResponse = serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed SSH key response: {}", e)))?;

        Ok(response
            .value
            .into_iter()
            .find(|entry| entry.format.as_deref() == Some(SSH_KEY_FORMAT))
            .and_then(|entry| entry.private_key)
            .filter(|key| !key.trim().is_empty()))
    }
}

#[async_trait]
impl SessionApi for ApiClient {
    async fn logon(&self, username: &str, password: &str) -> Result<Token, ApiError> {
        let url = self.url("Auth/RADIUS/Logon");
        debug!(url = %url, username, "Sending logon request");

        let response = self
            .client
            .post(&url)
            .json(&LogonRequest {
                username,
                password,
                concurrent_session: true,
            })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let body = response.text().await?;
        Self::parse_logon_token(&body)
    }

    async fn probe(&self, token: &Token) -> bool {
        let auth = match Self::auth_value(token) {
            Ok(auth) => auth,
            Err(e) => {
                warn!(error = %e, "Cannot probe with malformed token");
                return false;
            }
        };

        let result = self
            .client
            .get(self.url("Safes?limit=1"))
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await;

        match result {
            Ok(response) if response.status().as_u16() < 400 => true,
            Ok(response) => {
                debug!(status = %response.status(), "Probe rejected");
                false
            }
            Err(e) => {
                debug!(error = %e, timeout = e.is_timeout(), "Probe failed to reach vault");
                false
            }
        }
    }

    async fn logoff(&self, token: &Token) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("Auth/Logoff"))
            .header(header::AUTHORIZATION, Self::auth_value(token)?)
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl SshKeySource for ApiClient {
    async fn fetch_ssh_key(&self) -> Result<Option<String>, ApiError> {
        let token = self.token.as_ref().ok_or(ApiError::NoToken)?;

        let response = self
            .client
            .post(self.url("Users/Secret/SSHKeys/Cache/"))
            .header(header::AUTHORIZATION, Self::auth_value(token)?)
            .json(&SshKeyRequest {
                key_password: "",
                formats: [SSH_KEY_FORMAT],
            })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let body = response.text().await?;
        Self::parse_ssh_key(&body)
    }
}
