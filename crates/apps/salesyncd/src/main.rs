//! salesyncd - mailbox sync daemon
//!
//! Serves the sync trigger, status and consent endpoints, and runs the
//! interval scheduler in the same process.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use salesync::{
    CredentialManager, FleetDriver, GmailClient, GmailCredentials, GoogleOAuth, LogReporter,
    MailProvider, OAuthToken, Orchestrator, SqliteSalesStore, SyncConfig, SyncError, SyncResult,
    TokenRefresher,
};
use std::sync::Arc;
use tokio::sync::watch;

mod auth;
mod consent;
mod error;
mod scheduler;
mod server;

use auth::StaticSessions;
use consent::ConsentFlow;
use server::AppState;

/// Refresher used when no OAuth client is configured.
///
/// Fails as transient so accounts are retried, not flagged for reauthorization.
struct Unconfigured;

impl TokenRefresher for Unconfigured {
    fn refresh(&self, _refresh_token: &str, _now: DateTime<Utc>) -> SyncResult<OAuthToken> {
        Err(SyncError::TransientCredential {
            message: "no OAuth client configured".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let config = SyncConfig::load().context("Failed to load sync configuration")?;
    if config.trigger_secret.is_none() {
        warn!("No trigger secret configured; only user sessions can trigger syncs");
    }

    let db_path = config.resolved_database_path()?;
    let store = Arc::new(SqliteSalesStore::new(&db_path)?);
    info!("Using database at {}", db_path.display());

    // Load Gmail credentials from config file or environment
    let oauth = match GmailCredentials::load() {
        Ok(creds) => Some(Arc::new(GoogleOAuth::new(creds.client_id, creds.client_secret))),
        Err(e) => {
            warn!("Gmail credentials not found: {}", e);
            if let Some(path) = GmailCredentials::default_credentials_path() {
                warn!(
                    "Token refresh and mailbox connection are disabled. Either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            None
        }
    };

    let provider: Arc<dyn MailProvider> = Arc::new(GmailClient::new());
    let refresher: Arc<dyn TokenRefresher> = match &oauth {
        Some(oauth) => oauth.clone() as Arc<dyn TokenRefresher>,
        None => Arc::new(Unconfigured),
    };
    let consent = oauth.map(|oauth| {
        Arc::new(ConsentFlow::new(
            oauth,
            provider.clone(),
            config.oauth_redirect_uri.clone(),
        ))
    });

    let listen_addr = config.listen_addr.clone();
    let secret = config.trigger_secret.as_deref().map(Arc::from);
    let tick = scheduler::tick_for(config.sync_interval_secs);

    let orchestrator = Orchestrator::new(
        config,
        store,
        provider,
        CredentialManager::new(refresher),
        Arc::new(LogReporter),
    );
    let fleet = Arc::new(FleetDriver::new(Arc::new(orchestrator))?);

    let sessions = StaticSessions::load().context("Failed to load sessions")?;
    info!("Loaded {} user sessions", sessions.len());

    let state = AppState {
        fleet: fleet.clone(),
        secret,
        sessions: Arc::new(sessions),
        consent,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(scheduler::run(fleet, tick, shutdown_rx));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Listening on {}", listen_addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!("Scheduler task failed: {}", e);
    }
    Ok(())
}
