//! HTTP error type and its JSON payload

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use salesync::{FleetSummary, SyncError};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub error_code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
    /// Present when a sync pass ran but every account failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<FleetSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    /// Every account that ran failed
    #[error("sync failed for every account")]
    SyncFailed(FleetSummary),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized("Missing or invalid credentials".to_string())
    }

    fn to_status_and_payload(&self) -> (StatusCode, ErrorBody) {
        let (status, code, summary) = match self {
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", None),
            Self::SyncFailed(summary) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SYNC_FAILED",
                Some(summary.clone()),
            ),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", None),
        };
        (
            status,
            ErrorBody {
                error: ErrorDetail {
                    error_code: code,
                    message: self.to_string(),
                },
                summary,
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = self.to_status_and_payload();
        (status, Json(payload)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        log::error!("Request failed: {}", err);
        Self::Internal(err.user_message())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        log::error!("Request failed: {:#}", err);
        Self::Internal("Internal error".to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        log::error!("Blocking task failed: {}", err);
        Self::Internal("Internal error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_failed_payload_carries_summary() {
        let summary = FleetSummary {
            accounts_processed: 1,
            errors: vec!["a1: boom".into()],
            failed: 1,
            ..Default::default()
        };
        let (status, body) = ApiError::SyncFailed(summary).to_status_and_payload();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let json = serde_json::to_value(body).unwrap();
        assert_eq!(json["error"]["errorCode"], "SYNC_FAILED");
        assert_eq!(json["summary"]["accountsProcessed"], 1);
    }

    #[test]
    fn test_internal_detail_is_not_leaked() {
        let err: ApiError = anyhow::anyhow!("disk /var/lib/x unreadable").into();
        let (_, body) = err.to_status_and_payload();
        assert_eq!(body.error.message, "Internal error");
        assert!(body.summary.is_none());
    }
}
