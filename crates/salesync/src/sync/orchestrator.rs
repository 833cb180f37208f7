//! Per-account sync cycle
//!
//! One cycle walks `Locking → Fetching → Classifying → Reconciling →
//! Committing` strictly in order. The account lock is held from the moment
//! it is acquired until the cycle returns, whatever the outcome.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use super::classifier::MessageClassifier;
use super::fetcher::ChangeLogFetcher;
use super::lock::{AccountLock, LockAttempt};
use super::reconcile::Reconciler;
use super::retry::RetryPolicy;
use super::session::{ProviderSession, Step};
use super::timing::Deadline;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::gmail::{CredentialManager, MailProvider};
use crate::models::{Account, CandidateEvent, HistoryCursor, MessageId, SyncState};
use crate::quota::QuotaGovernor;
use crate::report::{Reporter, SyncEvent};
use crate::storage::SalesStore;

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Locking,
    Fetching,
    Classifying,
    Reconciling,
    Committing,
    ErrorCooldown,
}

/// Why a cycle did nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    UnknownAccount,
    NoCredentials,
    ReauthRequired,
    Paused { until: DateTime<Utc> },
    LockHeld { holder: String },
}

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Message ids handed to the classifier
    pub messages_added: usize,
    pub candidates: usize,
    pub created: usize,
    pub updated: usize,
    pub expired: usize,
    pub messages_skipped: usize,
    pub used_fallback: bool,
    pub api_calls: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleStats),
    Skipped(SkipReason),
    /// The daily quota ran out; nothing was committed or counted as a failure
    Deferred,
    Failed {
        kind: ErrorKind,
        /// Safe to show to end users
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub account_id: String,
    pub outcome: CycleOutcome,
}

/// Runs sync cycles for single accounts.
///
/// Shared across the fleet's workers; all per-cycle state lives on the stack
/// of [`Orchestrator::run_cycle`].
pub struct Orchestrator {
    config: SyncConfig,
    store: Arc<dyn SalesStore>,
    provider: Arc<dyn MailProvider>,
    credentials: CredentialManager,
    quota: Arc<QuotaGovernor>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    retry: RetryPolicy,
    fetcher: ChangeLogFetcher,
    classifier: MessageClassifier,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SalesStore>,
        provider: Arc<dyn MailProvider>,
        credentials: CredentialManager,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let quota = Arc::new(QuotaGovernor::new(
            config.daily_quota_units,
            config.min_call_spacing(),
        ));
        Self {
            retry: RetryPolicy::from_config(&config),
            fetcher: ChangeLogFetcher::from_config(&config),
            classifier: MessageClassifier::from_config(&config),
            config,
            store,
            provider,
            credentials,
            quota,
            clock: Arc::new(SystemClock),
            reporter,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a quota ledger with other orchestrators in this process
    pub fn with_quota(mut self, quota: Arc<QuotaGovernor>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SalesStore> {
        &self.store
    }

    pub fn quota(&self) -> &QuotaGovernor {
        &self.quota
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one cycle for `account_id`.
    ///
    /// Never fails: every problem ends up in the returned outcome and, for
    /// cycle failures, in the account's sync state.
    pub fn run_cycle(&self, account_id: &str) -> CycleReport {
        let outcome = match self.try_cycle(account_id) {
            Ok(outcome) => outcome,
            // Only reachable when the store fails before the lock is taken
            Err(e) => {
                warn!("[{}] sync cycle could not start: {}", account_id, e);
                CycleOutcome::Failed {
                    kind: e.kind(),
                    message: e.user_message(),
                }
            }
        };

        CycleReport {
            account_id: account_id.to_string(),
            outcome,
        }
    }

    fn try_cycle(&self, account_id: &str) -> SyncResult<CycleOutcome> {
        let now = self.clock.now();

        let Some(account) = self.store.get_account(account_id)? else {
            return Ok(self.skip(account_id, SkipReason::UnknownAccount));
        };
        let state = self
            .store
            .get_sync_state(account_id)?
            .unwrap_or_else(|| SyncState::new(account_id));

        if state.reauth_required {
            return Ok(self.skip(account_id, SkipReason::ReauthRequired));
        }
        if let Some(until) = state.paused_until
            && state.is_paused(now)
        {
            self.phase(account_id, SyncPhase::ErrorCooldown);
            return Ok(self.skip(account_id, SkipReason::Paused { until }));
        }
        if account.token.is_none() {
            return Ok(self.skip(account_id, SkipReason::NoCredentials));
        }

        self.phase(account_id, SyncPhase::Locking);
        let guard = match AccountLock::try_acquire(
            self.store.as_ref(),
            account_id,
            now,
            self.config.stale_lock_after(),
        )? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Held { holder } => {
                return Ok(self.skip(account_id, SkipReason::LockHeld { holder }));
            }
        };
        if let Some(previous_holder) = guard.recovered_from() {
            self.reporter.report(&SyncEvent::LockRecovered {
                account_id: account_id.to_string(),
                previous_holder: previous_holder.to_string(),
            });
        }

        // Re-read under the lock; a previous holder may have committed since
        let state = self.store.get_sync_state(account_id)?.unwrap_or(state);
        let result = self.locked_cycle(&account, state, &guard);

        // The guard outlives every state write below
        let outcome = match result {
            Ok(stats) => {
                self.reporter.report(&SyncEvent::CycleCompleted {
                    account_id: account_id.to_string(),
                    stats: stats.clone(),
                });
                CycleOutcome::Completed(stats)
            }
            Err(e) if e.kind() == ErrorKind::QuotaExhausted => {
                debug!("[{}] {}", account_id, e);
                if let Some(mut state) = self.store.get_sync_state(account_id)? {
                    state.last_attempt_at = Some(self.clock.now());
                    self.store.save_sync_state(&state)?;
                }
                self.reporter.report(&SyncEvent::CycleDeferred {
                    account_id: account_id.to_string(),
                });
                CycleOutcome::Deferred
            }
            Err(e) => self.fail(account_id, e)?,
        };

        drop(guard);
        Ok(outcome)
    }

    /// Fetch, classify, reconcile and commit while holding the lock
    fn locked_cycle(
        &self,
        account: &Account,
        state: SyncState,
        guard: &AccountLock<'_, dyn SalesStore>,
    ) -> SyncResult<CycleStats> {
        let started = Instant::now();
        let deadline = Deadline::after(self.config.cycle_timeout());
        let account_id = account.id.as_str();
        let mut stats = CycleStats::default();

        // 1. Get a usable access token
        self.phase(account_id, SyncPhase::Fetching);
        let stored_token = account
            .token
            .as_ref()
            .ok_or_else(|| SyncError::ReauthorizationRequired {
                reason: "no credentials stored".to_string(),
            })?;
        let grant = self.retry.run(&deadline, Step::TokenRefresh, || {
            self.credentials.get_valid_token(stored_token, self.clock.now())
        })?;
        if grant.refreshed {
            self.store.save_account_token(account_id, &grant.token)?;
        }

        let session = ProviderSession::new(
            self.provider.as_ref(),
            &self.quota,
            self.clock.as_ref(),
            &self.retry,
            deadline,
            grant.access_token(),
        );

        // 2. Collect the message ids that changed since the cursor
        let (to_classify, new_cursor) = match &state.cursor {
            Some(cursor) => match self.fetcher.fetch_changes(&session, cursor) {
                Ok(changes) => (changes.to_classify(), changes.new_cursor),
                Err(SyncError::CursorExpired { cursor }) => {
                    debug!("[{}] cursor {} expired", account_id, cursor);
                    stats.used_fallback = true;
                    self.full_window(account_id, &session, "history cursor expired")?
                }
                Err(e) => return Err(e),
            },
            None => {
                stats.used_fallback = true;
                self.full_window(account_id, &session, "no history cursor")?
            }
        };
        stats.messages_added = to_classify.len();
        guard.renew(self.clock.now())?;

        // 3. Classify in batches, renewing the lock between them
        self.phase(account_id, SyncPhase::Classifying);
        let mut pending: Vec<CandidateEvent> = Vec::new();
        let mut completed: Vec<CandidateEvent> = Vec::new();
        for batch in to_classify.chunks(self.config.batch_size.max(1)) {
            let result = self.classifier.classify_batch(&session, batch)?;
            for (message_id, reason) in result.skipped {
                stats.messages_skipped += 1;
                self.reporter.report(&SyncEvent::MessageSkipped {
                    account_id: account_id.to_string(),
                    message_id,
                    reason,
                });
            }
            for event in result.events {
                if event.is_pending() {
                    pending.push(event);
                } else {
                    completed.push(event);
                }
            }
            guard.renew(self.clock.now())?;
        }
        stats.candidates = pending.len() + completed.len();

        // 4. Merge into sale records
        self.phase(account_id, SyncPhase::Reconciling);
        let now = self.clock.now();
        let reconciler = Reconciler::new(
            self.store.as_ref(),
            self.config.infer_completion_from_deadline,
        );
        let written = reconciler.reconcile_and_sweep(account_id, &pending, &completed, now)?;
        stats.created = written.created;
        stats.updated = written.updated;
        stats.expired = written.expired;

        // 5. Advance the cursor and reset error tracking in one write
        self.phase(account_id, SyncPhase::Committing);
        let committed = state.committed(new_cursor, now, stats.created, stats.updated);
        self.store.save_sync_state(&committed)?;

        stats.api_calls = session.calls();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.phase(account_id, SyncPhase::Idle);
        Ok(stats)
    }

    fn full_window(
        &self,
        account_id: &str,
        session: &ProviderSession<'_>,
        reason: &'static str,
    ) -> SyncResult<(Vec<MessageId>, HistoryCursor)> {
        self.reporter.report(&SyncEvent::FallbackUsed {
            account_id: account_id.to_string(),
            reason,
        });
        let scan = self.fetcher.fetch_full_window(
            session,
            self.classifier.signatures(),
            self.clock.now(),
        )?;
        if scan.truncated {
            warn!(
                "[{}] full-window scan stopped at {} messages",
                account_id,
                scan.message_ids.len()
            );
        }
        Ok((scan.message_ids.into_iter().collect(), scan.cursor))
    }

    /// Count a failed cycle against the account
    fn fail(&self, account_id: &str, error: SyncError) -> SyncResult<CycleOutcome> {
        let now = self.clock.now();
        let kind = error.kind();
        warn!("[{}] sync cycle failed: {}", account_id, error);

        let mut state = self
            .store
            .get_sync_state(account_id)?
            .unwrap_or_else(|| SyncState::new(account_id));
        let crossed = state.record_failure(
            error.user_message(),
            now,
            self.config.max_consecutive_errors,
            self.config.cooldown(),
        );
        if kind == ErrorKind::ReauthorizationRequired {
            state.reauth_required = true;
        }
        self.store.save_sync_state(&state)?;

        self.reporter.report(&SyncEvent::CycleFailed {
            account_id: account_id.to_string(),
            kind,
            consecutive_errors: state.consecutive_errors,
        });
        if crossed && let Some(until) = state.paused_until {
            self.phase(account_id, SyncPhase::ErrorCooldown);
            self.reporter.report(&SyncEvent::CooldownEntered {
                account_id: account_id.to_string(),
                until,
            });
        }

        Ok(CycleOutcome::Failed {
            kind,
            message: error.user_message(),
        })
    }

    fn skip(&self, account_id: &str, reason: SkipReason) -> CycleOutcome {
        self.reporter.report(&SyncEvent::CycleSkipped {
            account_id: account_id.to_string(),
            reason: reason.clone(),
        });
        CycleOutcome::Skipped(reason)
    }

    fn phase(&self, account_id: &str, phase: SyncPhase) {
        self.reporter.report(&SyncEvent::PhaseEntered {
            account_id: account_id.to_string(),
            phase,
        });
    }
}
