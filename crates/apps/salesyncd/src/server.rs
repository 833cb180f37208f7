//! HTTP routes: sync trigger, status, and mailbox consent
//!
//! Engine calls block (ureq, rusqlite, rayon), so every handler hands its
//! work to `spawn_blocking` and only awaits the result.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use salesync::{FleetDriver, FleetSummary, Orchestrator, QuotaSnapshot, SyncResult, SyncState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{Caller, SessionVerifier, authenticate};
use crate::consent::ConsentFlow;
use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetDriver>,
    pub secret: Option<Arc<str>>,
    pub sessions: Arc<dyn SessionVerifier>,
    /// Absent when no OAuth client is configured
    pub consent: Option<Arc<ConsentFlow>>,
}

impl AppState {
    fn caller(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        authenticate(headers, self.secret.as_deref(), self.sessions.as_ref())
    }

    fn consent(&self) -> Result<Arc<ConsentFlow>, ApiError> {
        self.consent
            .clone()
            .ok_or_else(|| ApiError::Unavailable("Mailbox connection is not configured".into()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route("/status", get(status))
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .with_state(state)
}

/// Scheduler calls sync every due account; user calls sync their own account
/// right away, whatever its interval.
async fn trigger_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FleetSummary>, ApiError> {
    let caller = state.caller(&headers)?;
    let fleet = state.fleet.clone();

    let summary = tokio::task::spawn_blocking(move || -> SyncResult<FleetSummary> {
        match caller {
            Caller::Scheduler => fleet.run_due(),
            Caller::User { account_id } => {
                // keeps the request alive if another cycle holds the lock
                fleet.orchestrator().store().request_sync(&account_id)?;
                Ok(fleet.run_accounts(&[account_id]))
            }
        }
    })
    .await??;

    if summary.is_total_failure() {
        return Err(ApiError::SyncFailed(summary));
    }
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub email: String,
    pub locked: bool,
    pub lock_holder: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub reauth_required: bool,
    pub sync_requested: bool,
    pub last_error: Option<String>,
    pub total_cycles: u64,
    pub total_failures: u64,
    pub total_created: u64,
    pub total_updated: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub accounts: Vec<AccountStatus>,
    /// Shared across accounts; only shown to the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let caller = state.caller(&headers)?;
    let fleet = state.fleet.clone();
    let response =
        tokio::task::spawn_blocking(move || collect_status(fleet.orchestrator(), &caller)).await??;
    Ok(Json(response))
}

fn collect_status(orchestrator: &Orchestrator, caller: &Caller) -> SyncResult<StatusResponse> {
    let store = orchestrator.store();
    let now = orchestrator.now();
    let stale_after = orchestrator.config().stale_lock_after();

    let accounts = match caller {
        Caller::Scheduler => store.list_accounts()?,
        Caller::User { account_id } => store.get_account(account_id)?.into_iter().collect(),
    };

    let mut statuses = Vec::with_capacity(accounts.len());
    for account in accounts {
        let state = store
            .get_sync_state(&account.id)?
            .unwrap_or_else(|| SyncState::new(&account.id));
        statuses.push(AccountStatus {
            locked: state.lock_is_live(now, stale_after),
            account_id: account.id,
            email: account.email,
            lock_holder: state.lock_holder,
            lock_acquired_at: state.lock_acquired_at,
            last_sync_at: state.last_sync_at,
            last_attempt_at: state.last_attempt_at,
            consecutive_errors: state.consecutive_errors,
            paused_until: state.paused_until,
            reauth_required: state.reauth_required,
            sync_requested: state.sync_requested,
            last_error: state.last_error,
            total_cycles: state.total_cycles,
            total_failures: state.total_failures,
            total_created: state.total_created,
            total_updated: state.total_updated,
        });
    }

    let quota = matches!(caller, Caller::Scheduler).then(|| orchestrator.quota().snapshot(now));
    Ok(StatusResponse {
        accounts: statuses,
        quota,
    })
}

#[derive(Debug, Deserialize)]
struct StartParams {
    account: Option<String>,
}

/// Redirect to Google's consent screen.
///
/// Users connect their own account; the scheduler may name any account,
/// which is how new accounts are provisioned.
async fn oauth_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
) -> Result<Redirect, ApiError> {
    let account_id = match state.caller(&headers)? {
        Caller::User { account_id } => account_id,
        Caller::Scheduler => params
            .account
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Missing account parameter".into()))?,
    };
    let consent = state.consent()?;
    let url = consent.start(&account_id, state.fleet.orchestrator().now());
    Ok(Redirect::to(&url))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<&'static str>, ApiError> {
    let consent = state.consent()?;
    if let Some(error) = params.error {
        return Err(ApiError::BadRequest(format!("Consent was not granted: {}", error)));
    }
    let (Some(code), Some(nonce)) = (params.code, params.state) else {
        return Err(ApiError::BadRequest("Missing code or state".into()));
    };

    let now = state.fleet.orchestrator().now();
    let account_id = consent
        .claim(&nonce, now)
        .ok_or_else(|| ApiError::BadRequest("Consent link expired or already used".into()))?;

    let fleet = state.fleet.clone();
    tokio::task::spawn_blocking(move || {
        consent.complete(fleet.orchestrator().store().as_ref(), &account_id, &code, now)
    })
    .await??;

    Ok(Html(
        "<html><body><h1>Mailbox connected</h1><p>You can close this window.</p></body></html>",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SECRET_HEADER, StaticSessions};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use salesync::gmail::api::{
        GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse,
    };
    use salesync::{
        Account, CredentialManager, GoogleOAuth, HistoryCursor, InMemorySalesStore, LogReporter,
        MailProvider, MessageId, OAuthToken, SalesStore, SyncConfig, SyncError, TokenRefresher,
    };
    use std::collections::HashMap;
    use tower::ServiceExt;

    /// Mailbox with nothing in it; `broken` fails every call
    struct EmptyMailbox {
        broken: bool,
    }

    impl EmptyMailbox {
        fn check(&self) -> SyncResult<()> {
            if self.broken {
                return Err(SyncError::Provider {
                    message: "HTTP 400".into(),
                });
            }
            Ok(())
        }
    }

    impl MailProvider for EmptyMailbox {
        fn list_history(
            &self,
            _token: &str,
            start: &HistoryCursor,
            _page_token: Option<&str>,
            _max_results: usize,
        ) -> SyncResult<HistoryResponse> {
            self.check()?;
            Ok(HistoryResponse {
                history: None,
                next_page_token: None,
                history_id: Some(start.to_string()),
            })
        }

        fn get_message(&self, _token: &str, id: &MessageId) -> SyncResult<GmailMessage> {
            Err(SyncError::Provider {
                message: format!("{} missing", id),
            })
        }

        fn search_messages(
            &self,
            _token: &str,
            _query: &str,
            _page_token: Option<&str>,
            _max_results: usize,
        ) -> SyncResult<ListMessagesResponse> {
            self.check()?;
            Ok(ListMessagesResponse::default())
        }

        fn get_profile(&self, _token: &str) -> SyncResult<ProfileResponse> {
            self.check()?;
            Ok(ProfileResponse {
                email_address: "seller@example.com".into(),
                messages_total: Some(0),
                history_id: "500".into(),
            })
        }
    }

    struct NoRefresh;

    impl TokenRefresher for NoRefresh {
        fn refresh(&self, _refresh_token: &str, _now: DateTime<Utc>) -> SyncResult<OAuthToken> {
            Err(SyncError::TransientCredential {
                message: "offline".into(),
            })
        }
    }

    fn fresh_token() -> OAuthToken {
        OAuthToken {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Some((Utc::now() + chrono::Duration::days(1)).timestamp()),
        }
    }

    fn app_state(broken: bool, consent: bool) -> AppState {
        let store = Arc::new(InMemorySalesStore::new());
        for id in ["a1", "a2"] {
            store
                .upsert_account(Account::new(id, format!("{id}@example.com")).with_token(fresh_token()))
                .unwrap();
        }

        let config = SyncConfig {
            trigger_secret: Some("s3cret".into()),
            min_call_spacing_ms: 0,
            ..Default::default()
        };
        let provider: Arc<dyn MailProvider> = Arc::new(EmptyMailbox { broken });
        let orchestrator = Orchestrator::new(
            config,
            store,
            provider.clone(),
            CredentialManager::new(Arc::new(NoRefresh)),
            Arc::new(LogReporter),
        );
        let fleet = Arc::new(FleetDriver::new(Arc::new(orchestrator)).unwrap());

        let sessions = StaticSessions::new(HashMap::from([
            ("tok-a1".to_string(), "a1".to_string()),
            ("tok-new".to_string(), "a9".to_string()),
        ]));
        let consent = consent.then(|| {
            Arc::new(ConsentFlow::new(
                Arc::new(GoogleOAuth::new("client".into(), "secret".into())),
                provider,
                "http://127.0.0.1:8787/oauth/callback",
            ))
        });

        AppState {
            fleet,
            secret: Some(Arc::from("s3cret")),
            sessions: Arc::new(sessions),
            consent,
        }
    }

    async fn send(
        state: AppState,
        method: &str,
        uri: &str,
        auth: Option<(&str, &str)>,
    ) -> (StatusCode, HeaderMap, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some((name, value)) = auth {
            request = request.header(name, value);
        }
        let response = router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, headers, json)
    }

    #[tokio::test]
    async fn test_sync_requires_auth() {
        let (status, _, body) = send(app_state(false, false), "POST", "/sync", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["errorCode"], "UNAUTHORIZED");

        let (status, _, _) = send(
            app_state(false, false),
            "POST",
            "/sync",
            Some((SECRET_HEADER, "wrong")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_scheduled_sync_runs_due_accounts() {
        let state = app_state(false, false);
        let (status, _, body) =
            send(state.clone(), "POST", "/sync", Some((SECRET_HEADER, "s3cret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accountsProcessed"], 2);
        assert_eq!(body["newRecordsCreated"], 0);
        assert_eq!(body["errors"], serde_json::json!([]));

        // both accounts just synced, nothing is due
        let (status, _, body) = send(state, "POST", "/sync", Some((SECRET_HEADER, "s3cret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accountsProcessed"], 0);
    }

    #[tokio::test]
    async fn test_user_sync_ignores_interval() {
        let state = app_state(false, false);
        for _ in 0..2 {
            let (status, _, body) = send(
                state.clone(),
                "POST",
                "/sync",
                Some(("authorization", "Bearer tok-a1")),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["accountsProcessed"], 1);
        }

        let sync_state = state.fleet.orchestrator().store().get_sync_state("a2").unwrap();
        assert!(sync_state.is_none_or(|s| s.total_cycles == 0));
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error() {
        let (status, _, body) = send(
            app_state(true, false),
            "POST",
            "/sync",
            Some((SECRET_HEADER, "s3cret")),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["errorCode"], "SYNC_FAILED");
        assert_eq!(body["summary"]["accountsProcessed"], 2);
        assert_eq!(body["summary"]["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_scoped_to_caller() {
        let state = app_state(false, false);
        send(state.clone(), "POST", "/sync", Some((SECRET_HEADER, "s3cret"))).await;

        let (status, _, body) =
            send(state.clone(), "GET", "/status", Some((SECRET_HEADER, "s3cret"))).await;
        assert_eq!(status, StatusCode::OK);
        let accounts = body["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0]["accountId"], "a1");
        assert_eq!(accounts[0]["locked"], false);
        assert_eq!(accounts[0]["totalCycles"], 1);
        assert_eq!(accounts[0]["consecutiveErrors"], 0);
        assert!(accounts[0]["lastSyncAt"].is_string());
        assert_eq!(accounts[0]["lastAttemptAt"], accounts[0]["lastSyncAt"]);
        assert!(body["quota"]["remaining"].is_u64());

        let (status, _, body) = send(
            state,
            "GET",
            "/status",
            Some(("authorization", "Bearer tok-a1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accounts"].as_array().unwrap().len(), 1);
        assert!(body.get("quota").is_none());
    }

    #[tokio::test]
    async fn test_consent_unconfigured() {
        let (status, _, body) = send(
            app_state(false, false),
            "GET",
            "/oauth/start",
            Some(("authorization", "Bearer tok-a1")),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["errorCode"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_consent_start_redirects_to_google() {
        let (status, headers, _) = send(
            app_state(false, true),
            "GET",
            "/oauth/start",
            Some(("authorization", "Bearer tok-new")),
        )
        .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        let location = headers[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://accounts.google.com/"));
        assert!(location.contains("state="));
    }

    #[tokio::test]
    async fn test_consent_start_needs_account_for_scheduler() {
        let (status, _, _) = send(
            app_state(false, true),
            "GET",
            "/oauth/start",
            Some((SECRET_HEADER, "s3cret")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_callback_rejects_forged_state() {
        let (status, _, body) = send(
            app_state(false, true),
            "GET",
            "/oauth/callback?code=abc&state=forged",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["errorCode"], "BAD_REQUEST");

        let (status, _, _) = send(
            app_state(false, true),
            "GET",
            "/oauth/callback?error=access_denied",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
