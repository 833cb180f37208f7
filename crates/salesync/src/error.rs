//! Error taxonomy for the sync engine
//!
//! Every failure the engine can surface is a variant of [`SyncError`]. Callers
//! branch on [`SyncError::kind`] rather than on message text.

use std::time::Duration;

/// Discriminant of a [`SyncError`], matched exhaustively by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ReauthorizationRequired,
    CursorExpired,
    RateLimited,
    TransientCredential,
    TransientProvider,
    QuotaExhausted,
    Timeout,
    Provider,
    Storage,
    RecordNotEditable,
    RecordNotFound,
}

impl ErrorKind {
    /// Stable machine-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ReauthorizationRequired => "reauthorization_required",
            ErrorKind::CursorExpired => "cursor_expired",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientCredential => "transient_credential",
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Provider => "provider",
            ErrorKind::Storage => "storage",
            ErrorKind::RecordNotEditable => "record_not_editable",
            ErrorKind::RecordNotFound => "record_not_found",
        }
    }
}

/// Errors produced by the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The user must grant access again; the account is paused until then
    #[error("Reauthorization required: {reason}")]
    ReauthorizationRequired { reason: String },

    /// The stored history cursor is unknown to the provider
    #[error("History cursor {cursor} expired or invalid")]
    CursorExpired { cursor: String },

    /// The provider throttled the request
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Token refresh failed for a reason other than a revoked grant
    #[error("Transient credential error: {message}")]
    TransientCredential { message: String },

    /// Network error or 5xx from the provider
    #[error("Transient provider error: {message}")]
    TransientProvider { message: String },

    /// The daily quota budget cannot cover the next call
    #[error("Daily quota exhausted ({method} needs {cost} units, {remaining} remaining)")]
    QuotaExhausted {
        method: &'static str,
        cost: u32,
        remaining: u32,
    },

    /// The cycle exceeded its wall-clock budget
    #[error("Sync cycle timed out before {step}")]
    Timeout { step: &'static str },

    /// Any other provider failure, propagated unchanged
    #[error("Provider error: {message}")]
    Provider { message: String },

    /// Storage backend failure
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// A sync-owned record was edited outside reconciliation
    #[error("Record {transaction_id} is sync-owned; only its purchase cost may be edited")]
    RecordNotEditable { transaction_id: String },

    #[error("Record {transaction_id} not found")]
    RecordNotFound { transaction_id: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ReauthorizationRequired { .. } => ErrorKind::ReauthorizationRequired,
            SyncError::CursorExpired { .. } => ErrorKind::CursorExpired,
            SyncError::RateLimited { .. } => ErrorKind::RateLimited,
            SyncError::TransientCredential { .. } => ErrorKind::TransientCredential,
            SyncError::TransientProvider { .. } => ErrorKind::TransientProvider,
            SyncError::QuotaExhausted { .. } => ErrorKind::QuotaExhausted,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::Provider { .. } => ErrorKind::Provider,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::RecordNotEditable { .. } => ErrorKind::RecordNotEditable,
            SyncError::RecordNotFound { .. } => ErrorKind::RecordNotFound,
        }
    }

    /// Whether the backoff schedule should retry the failed call
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::TransientCredential | ErrorKind::TransientProvider
        )
    }

    /// Message safe to show to end users.
    ///
    /// Provider and storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::ReauthorizationRequired { .. } => {
                "Mailbox access was revoked or expired; please reconnect the account".to_string()
            }
            SyncError::CursorExpired { .. } => "Mailbox history was reset".to_string(),
            SyncError::RateLimited { .. } => {
                "The mail provider is throttling requests; sync will retry later".to_string()
            }
            SyncError::TransientCredential { .. } => {
                "Could not refresh mailbox access; sync will retry later".to_string()
            }
            SyncError::TransientProvider { .. } | SyncError::Provider { .. } => {
                "The mail provider returned an error; sync will retry later".to_string()
            }
            SyncError::QuotaExhausted { .. } => {
                "Daily mailbox quota reached; sync deferred".to_string()
            }
            SyncError::Timeout { .. } => "Sync took too long and was stopped".to_string(),
            SyncError::Storage(_) => "Internal storage error".to_string(),
            SyncError::RecordNotEditable { .. } | SyncError::RecordNotFound { .. } => {
                self.to_string()
            }
        }
    }
}

/// Result alias used throughout the engine
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(
            SyncError::TransientProvider {
                message: "502".into()
            }
            .is_retryable()
        );
        assert!(
            !SyncError::CursorExpired {
                cursor: "100".into()
            }
            .is_retryable()
        );
        assert!(
            !SyncError::ReauthorizationRequired {
                reason: "revoked".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_user_message_hides_provider_details() {
        let err = SyncError::Provider {
            message: "HTTP 418 secret-internal-detail".into(),
        };
        assert!(!err.user_message().contains("secret-internal-detail"));

        let err = SyncError::Storage(anyhow::anyhow!("disk path /var/db leaked"));
        assert!(!err.user_message().contains("/var/db"));
    }

    #[test]
    fn test_storage_from_anyhow() {
        let err: SyncError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.kind().as_str(), "storage");
    }
}
