//! Account model representing a connected mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth grant stored for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds; `None` when the provider did not say
    pub expires_at: Option<i64>,
}

/// A registered mailbox account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable account identifier (unique)
    pub id: String,
    /// Mailbox address
    pub email: String,
    /// When the account was connected
    pub added_at: DateTime<Utc>,
    /// OAuth token data; `None` until the user grants access
    pub token: Option<OAuthToken>,
}

impl Account {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            added_at: Utc::now(),
            token: None,
        }
    }

    /// Set the OAuth token
    pub fn with_token(mut self, token: OAuthToken) -> Self {
        self.token = Some(token);
        self
    }
}
