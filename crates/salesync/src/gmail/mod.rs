//! Gmail API integration
//!
//! This module provides:
//! - OAuth2 token validation and refresh
//! - Gmail API client for history, message, search and profile calls
//! - Response normalization to [`MailMessage`](crate::models::MailMessage)

mod auth;
mod client;
mod normalize;

pub use auth::{CredentialManager, GoogleOAuth, TokenGrant, TokenRefresher};
pub use client::GmailClient;
pub use normalize::normalize_message;

use crate::error::SyncResult;
use crate::models::{HistoryCursor, MessageId};
use api::{GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse};

/// The provider calls the sync engine depends on.
///
/// Every method takes an already-validated access token; token lifecycle is
/// the [`CredentialManager`]'s job. Implementations map provider failures to
/// the matching [`SyncError`](crate::error::SyncError) variant.
pub trait MailProvider: Send + Sync {
    /// One page of the change log since `start`
    fn list_history(
        &self,
        token: &str,
        start: &HistoryCursor,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<HistoryResponse>;

    /// Full message by ID
    fn get_message(&self, token: &str, id: &MessageId) -> SyncResult<GmailMessage>;

    /// One page of message IDs matching a Gmail search query
    fn search_messages(
        &self,
        token: &str,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<ListMessagesResponse>;

    /// Mailbox profile, including the current history position
    fn get_profile(&self, token: &str) -> SyncResult<ProfileResponse>;
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing messages
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
        pub label_ids: Option<Vec<String>>,
    }

    /// Full message from Gmail API
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub internal_date: String,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded)
    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageBody {
        pub size: Option<u32>,
        pub data: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// One page of `users.history.list`
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        /// Current mailbox history position
        pub history_id: Option<String>,
    }

    /// A single change-log entry
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<HistoryMessageChange>>,
        pub messages_deleted: Option<Vec<HistoryMessageChange>>,
        pub labels_added: Option<Vec<HistoryLabelChange>>,
        pub labels_removed: Option<Vec<HistoryLabelChange>>,
    }

    /// A message added to or deleted from the mailbox
    #[derive(Debug, Clone, Deserialize)]
    pub struct HistoryMessageChange {
        pub message: MessageRef,
    }

    /// Labels added to or removed from a message
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MessageRef,
        pub label_ids: Option<Vec<String>>,
    }

    /// Response from `users.getProfile`
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub history_id: String,
    }

    /// Error envelope returned by Google APIs
    #[derive(Debug, Deserialize)]
    pub struct ErrorResponse {
        pub error: ErrorDetail,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorDetail {
        pub code: Option<u16>,
        pub message: Option<String>,
        pub errors: Option<Vec<ErrorReason>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorReason {
        pub reason: Option<String>,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_history_page() {
            let json = r#"{
                "history": [
                    {
                        "id": "105",
                        "messagesAdded": [
                            { "message": { "id": "m1", "threadId": "t1", "labelIds": ["INBOX"] } }
                        ],
                        "labelsAdded": [
                            { "message": { "id": "m2", "threadId": "t2" }, "labelIds": ["STARRED"] }
                        ]
                    }
                ],
                "nextPageToken": "p2",
                "historyId": "110"
            }"#;

            let page: HistoryResponse = serde_json::from_str(json).unwrap();
            let records = page.history.unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].messages_added.as_ref().unwrap()[0].message.id, "m1");
            assert_eq!(records[0].labels_added.as_ref().unwrap()[0].message.id, "m2");
            assert_eq!(page.next_page_token.as_deref(), Some("p2"));
            assert_eq!(page.history_id.as_deref(), Some("110"));
        }

        #[test]
        fn test_parse_error_envelope() {
            let json = r#"{
                "error": {
                    "code": 403,
                    "message": "User-rate limit exceeded",
                    "errors": [ { "reason": "userRateLimitExceeded" } ]
                }
            }"#;
            let err: ErrorResponse = serde_json::from_str(json).unwrap();
            assert_eq!(err.error.code, Some(403));
            assert_eq!(
                err.error.errors.unwrap()[0].reason.as_deref(),
                Some("userRateLimitExceeded")
            );
        }
    }
}
