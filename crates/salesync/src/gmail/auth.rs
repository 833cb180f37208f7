//! Gmail OAuth2 token lifecycle
//!
//! [`CredentialManager`] decides whether a stored token is still usable and
//! refreshes it through a [`TokenRefresher`] when it is not.
//! [`GoogleOAuth`] is the production refresher, talking to Google's token
//! endpoint with synchronous HTTP (ureq).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use ureq::Agent;

use crate::error::{SyncError, SyncResult};
use crate::models::OAuthToken;

/// Exchanges a refresh token for a new access token
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str, now: DateTime<Utc>) -> SyncResult<OAuthToken>;
}

/// A usable access token, and whether it had to be refreshed to get it
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub token: OAuthToken,
    /// True when `token` differs from the stored one and must be persisted
    pub refreshed: bool,
}

impl TokenGrant {
    pub fn access_token(&self) -> &str {
        &self.token.access_token
    }
}

/// Validates and refreshes OAuth access tokens
pub struct CredentialManager {
    refresher: Arc<dyn TokenRefresher>,
    safety_buffer: chrono::Duration,
}

impl CredentialManager {
    /// Tokens expiring within this window are refreshed early
    pub const SAFETY_BUFFER_SECS: i64 = 5 * 60;

    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            safety_buffer: chrono::Duration::seconds(Self::SAFETY_BUFFER_SECS),
        }
    }

    /// Whether `token` must be refreshed before use at `now`
    pub fn is_expired(&self, token: &OAuthToken, now: DateTime<Utc>) -> bool {
        match token.expires_at {
            Some(expires_at) => expires_at <= (now + self.safety_buffer).timestamp(),
            None => true,
        }
    }

    /// Get a valid access token, refreshing it if needed
    ///
    /// # Errors
    /// - `ReauthorizationRequired` when the token is expired and there is no
    ///   refresh token, or the grant was revoked
    /// - `TransientCredential` for any other refresh failure
    pub fn get_valid_token(&self, current: &OAuthToken, now: DateTime<Utc>) -> SyncResult<TokenGrant> {
        if !self.is_expired(current, now) {
            return Ok(TokenGrant {
                token: current.clone(),
                refreshed: false,
            });
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            return Err(SyncError::ReauthorizationRequired {
                reason: "access token expired and no refresh token is stored".to_string(),
            });
        };

        let mut token = self.refresher.refresh(refresh_token, now)?;
        // Google omits the refresh token on refresh responses
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }

        Ok(TokenGrant {
            token,
            refreshed: true,
        })
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Error body from Google's token endpoint
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// OAuth2 client for Google's authorization server
pub struct GoogleOAuth {
    client_id: String,
    client_secret: String,
    token_url: String,
    agent: Agent,
}

impl GoogleOAuth {
    /// Gmail API OAuth2 endpoints
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    /// Read-only access is enough to classify mail
    const GMAIL_READONLY_SCOPE: &'static str = "https://www.googleapis.com/auth/gmail.readonly";

    pub fn new(client_id: String, client_secret: String) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(30)))
            .build();
        Self {
            client_id,
            client_secret,
            token_url: Self::TOKEN_URL.to_string(),
            agent: config.into(),
        }
    }

    /// Override the token endpoint (used by tests and proxies)
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// URL the user visits to grant access.
    ///
    /// `state` comes back on the callback and identifies the account.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            Self::AUTH_URL,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(Self::GMAIL_READONLY_SCOPE),
            urlencoding::encode(state),
        )
    }

    /// Exchange an authorization code from the consent callback for tokens
    pub fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<OAuthToken> {
        self.post_token_request(
            [
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ],
            now,
        )
    }

    fn post_token_request<'a>(
        &self,
        form: [(&'a str, &'a str); 5],
        now: DateTime<Utc>,
    ) -> SyncResult<OAuthToken> {
        let mut response = self
            .agent
            .post(&self.token_url)
            .send_form(form)
            .map_err(|e| SyncError::TransientCredential {
                message: format!("token request failed: {}", e),
            })?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| SyncError::TransientCredential {
                message: format!("failed to read token response: {}", e),
            })?;

        if !(200..300).contains(&status) {
            return Err(classify_token_failure(status, &body));
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| SyncError::TransientCredential {
                message: format!("failed to parse token response: {}", e),
            })?;

        Ok(OAuthToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_in.map(|d| now.timestamp() + d as i64),
        })
    }
}

impl TokenRefresher for GoogleOAuth {
    fn refresh(&self, refresh_token: &str, now: DateTime<Utc>) -> SyncResult<OAuthToken> {
        self.post_token_request(
            [
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
                ("scope", Self::GMAIL_READONLY_SCOPE),
            ],
            now,
        )
    }
}

/// A revoked or expired grant shows up as `invalid_grant`; everything else
/// (server errors, misconfiguration, throttling) is worth retrying later.
fn classify_token_failure(status: u16, body: &str) -> SyncError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => SyncError::ReauthorizationRequired {
            reason: err
                .error_description
                .unwrap_or_else(|| "grant revoked".to_string()),
        },
        Ok(err) => SyncError::TransientCredential {
            message: format!("HTTP {}: {}", status, err.error),
        },
        Err(_) => SyncError::TransientCredential {
            message: format!("HTTP {}", status),
        },
    }
}
