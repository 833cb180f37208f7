//! Normalized mailbox message, the classifier's input

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "Parcel Service")
    pub name: Option<String>,
    /// Email address (e.g., "no-reply@example.com")
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "Shop <no-reply@shop.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"');
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Domain part of the address, lowercased
    pub fn domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
    }
}

/// A mailbox message reduced to the fields the classifier reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: MessageId,
    pub from: EmailAddress,
    pub subject: String,
    /// Provider snippet with HTML entities decoded
    pub snippet: String,
    /// Plain text body; HTML-only messages are stripped to text
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    /// Gmail label IDs (e.g., "INBOX", "CATEGORY_UPDATES")
    pub label_ids: Vec<String>,
}

impl MailMessage {
    /// Subject, snippet and body joined for pattern matching
    pub fn searchable_text(&self) -> String {
        format!("{}\n{}\n{}", self.subject, self.snippet, self.body_text)
    }
}
