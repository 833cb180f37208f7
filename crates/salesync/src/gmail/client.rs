//! Gmail API HTTP client
//!
//! Implements [`MailProvider`] over the Gmail REST API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use serde::de::DeserializeOwned;
use std::time::Duration;
use ureq::Agent;

use super::MailProvider;
use super::api::{ErrorResponse, GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse};
use crate::error::{SyncError, SyncResult};
use crate::models::{HistoryCursor, MessageId};

/// Gmail API client
pub struct GmailClient {
    agent: Agent,
    base_url: String,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Per-request network timeout
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// History event types that can change a message's classification
    const HISTORY_TYPES: [&'static str; 4] =
        ["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"];

    pub fn new() -> Self {
        Self::with_base_url(Self::BASE_URL)
    }

    /// Point the client at another endpoint (used by tests and proxies)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Self::REQUEST_TIMEOUT))
            .build();
        Self {
            agent: config.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// GET `url` and decode the JSON body, mapping failures to [`SyncError`]
    fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        not_found: impl FnOnce() -> SyncError,
    ) -> SyncResult<T> {
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", token))
            .call()
            .map_err(|e| SyncError::TransientProvider {
                message: format!("request failed: {}", e),
            })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return response
                .body_mut()
                .read_json::<T>()
                .map_err(|e| SyncError::Provider {
                    message: format!("failed to parse response: {}", e),
                });
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.body_mut().read_to_string().unwrap_or_default();

        Err(classify_failure(status, &body, retry_after, not_found))
    }
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MailProvider for GmailClient {
    /// List history since a given historyId
    ///
    /// # Errors
    /// Returns `CursorExpired` if the history ID is too old (404 from Gmail)
    fn list_history(
        &self,
        token: &str,
        start: &HistoryCursor,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<HistoryResponse> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&maxResults={}",
            self.base_url,
            urlencoding::encode(start.as_str()),
            max_results.clamp(1, 500)
        );
        for history_type in Self::HISTORY_TYPES {
            url.push_str(&format!("&historyTypes={}", history_type));
        }
        if let Some(page) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }

        self.get_json(&url, token, || SyncError::CursorExpired {
            cursor: start.to_string(),
        })
    }

    fn get_message(&self, token: &str, id: &MessageId) -> SyncResult<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            self.base_url,
            urlencoding::encode(id.as_str())
        );

        self.get_json(&url, token, || SyncError::Provider {
            message: format!("message {} no longer exists", id),
        })
    }

    fn search_messages(
        &self,
        token: &str,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?q={}&maxResults={}",
            self.base_url,
            urlencoding::encode(query),
            max_results.clamp(1, 500)
        );
        if let Some(page) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }

        self.get_json(&url, token, || SyncError::Provider {
            message: "message search endpoint not found".to_string(),
        })
    }

    fn get_profile(&self, token: &str) -> SyncResult<ProfileResponse> {
        let url = format!("{}/users/me/profile", self.base_url);
        self.get_json(&url, token, || SyncError::Provider {
            message: "mailbox profile not found".to_string(),
        })
    }
}

/// 403 reasons that mean a usage limit, not missing access
const QUOTA_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "quotaExceeded",
];

/// Map a non-2xx Gmail response to the error taxonomy.
///
/// 403 is ambiguous in Gmail: quota reasons mean "slow down", anything else
/// means the grant lacks access.
pub(crate) fn classify_failure(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
    not_found: impl FnOnce() -> SyncError,
) -> SyncError {
    let detail = serde_json::from_str::<ErrorResponse>(body).ok().map(|e| e.error);
    let reasons: Vec<String> = detail
        .as_ref()
        .and_then(|d| d.errors.as_ref())
        .map(|errs| errs.iter().filter_map(|e| e.reason.clone()).collect())
        .unwrap_or_default();
    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| format!("HTTP {}", status));

    let rate_limited = reasons
        .iter()
        .any(|r| QUOTA_REASONS.contains(&r.as_str()));

    match status {
        401 => SyncError::ReauthorizationRequired { reason: message },
        403 if rate_limited => SyncError::RateLimited { retry_after },
        403 => SyncError::ReauthorizationRequired { reason: message },
        404 => not_found(),
        429 => SyncError::RateLimited { retry_after },
        500..=599 => SyncError::TransientProvider { message },
        _ => SyncError::Provider { message },
    }
}
