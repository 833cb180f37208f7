//! Google consent flow: connects a mailbox to an account

use chrono::{DateTime, Duration, Utc};
use log::info;
use salesync::{Account, GoogleOAuth, MailProvider, SalesStore, SyncResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// How long a consent link stays valid
const PENDING_TTL_MINUTES: i64 = 10;

/// Outstanding consent requests, keyed by the opaque `state` parameter
#[derive(Debug, Default)]
pub struct PendingConsents {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl PendingConsents {
    /// Register a consent request and return its state token
    pub fn issue(&self, account_id: &str, now: DateTime<Utc>) -> String {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let mut entries = self.lock();
        entries.retain(|_, (_, issued)| !expired(*issued, now));
        entries.insert(state.clone(), (account_id.to_string(), now));
        state
    }

    /// Consume a state token; each one works once
    pub fn take(&self, state: &str, now: DateTime<Utc>) -> Option<String> {
        let (account_id, issued) = self.lock().remove(state)?;
        (!expired(issued, now)).then_some(account_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn expired(issued: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - issued > Duration::minutes(PENDING_TTL_MINUTES)
}

pub struct ConsentFlow {
    oauth: Arc<GoogleOAuth>,
    provider: Arc<dyn MailProvider>,
    redirect_uri: String,
    pending: PendingConsents,
}

impl ConsentFlow {
    pub fn new(
        oauth: Arc<GoogleOAuth>,
        provider: Arc<dyn MailProvider>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            oauth,
            provider,
            redirect_uri: redirect_uri.into(),
            pending: PendingConsents::default(),
        }
    }

    /// URL to send the user to for granting mailbox access
    pub fn start(&self, account_id: &str, now: DateTime<Utc>) -> String {
        let state = self.pending.issue(account_id, now);
        self.oauth.authorization_url(&self.redirect_uri, &state)
    }

    /// Account a callback's `state` belongs to, if it is still valid
    pub fn claim(&self, state: &str, now: DateTime<Utc>) -> Option<String> {
        self.pending.take(state, now)
    }

    /// Exchange the callback code and store the grant.
    ///
    /// Creates the account on first connection. Blocking: performs HTTP.
    pub fn complete(
        &self,
        store: &dyn SalesStore,
        account_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<Account> {
        let token = self.oauth.exchange_code(code, &self.redirect_uri, now)?;
        let profile = self.provider.get_profile(&token.access_token)?;

        let account = match store.get_account(account_id)? {
            Some(mut account) => {
                store.store_credentials(account_id, &token)?;
                account.token = Some(token);
                account
            }
            None => {
                let account =
                    Account::new(account_id, profile.email_address.clone()).with_token(token);
                store.upsert_account(account.clone())?;
                account
            }
        };
        store.request_sync(account_id)?;

        info!("[{}] connected mailbox {}", account_id, profile.email_address);
        Ok(account)
    }
}
