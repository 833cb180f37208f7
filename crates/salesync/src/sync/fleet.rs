//! Fleet driver: picks due accounts and runs their cycles on a bounded pool

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;

use super::orchestrator::{CycleOutcome, CycleReport, Orchestrator};
use super::timing::interval_elapsed;
use crate::error::SyncResult;
use crate::models::SyncState;

/// Cap on error messages returned to callers
pub const MAX_SUMMARY_ERRORS: usize = 20;

/// Aggregate result of one fleet pass, as returned by the trigger endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSummary {
    /// Accounts whose cycle actually ran (not skipped)
    pub accounts_processed: usize,
    pub new_records_created: usize,
    pub records_updated: usize,
    /// User-safe messages, at most [`MAX_SUMMARY_ERRORS`]
    pub errors: Vec<String>,
    /// Cycles that ran and failed
    #[serde(skip)]
    pub failed: usize,
}

impl FleetSummary {
    pub fn from_reports(reports: &[CycleReport]) -> Self {
        let mut summary = FleetSummary::default();
        for report in reports {
            let error = match &report.outcome {
                CycleOutcome::Completed(stats) => {
                    summary.accounts_processed += 1;
                    summary.new_records_created += stats.created;
                    summary.records_updated += stats.updated;
                    None
                }
                CycleOutcome::Skipped(_) => None,
                CycleOutcome::Deferred => {
                    summary.accounts_processed += 1;
                    Some("Daily mailbox quota reached; sync deferred".to_string())
                }
                CycleOutcome::Failed { message, .. } => {
                    summary.accounts_processed += 1;
                    summary.failed += 1;
                    Some(message.clone())
                }
            };
            if let Some(message) = error
                && summary.errors.len() < MAX_SUMMARY_ERRORS
            {
                summary
                    .errors
                    .push(format!("{}: {}", report.account_id, message));
            }
        }
        summary
    }

    /// Every cycle that ran failed
    pub fn is_total_failure(&self) -> bool {
        self.failed > 0 && self.failed == self.accounts_processed
    }
}

/// Runs many accounts' cycles with at most N in flight
pub struct FleetDriver {
    orchestrator: Arc<Orchestrator>,
    pool: rayon::ThreadPool,
}

impl FleetDriver {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let workers = orchestrator.config().max_concurrent_accounts.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sync-worker-{}", i))
            .build()
            .context("Failed to build sync worker pool")?;
        Ok(Self { orchestrator, pool })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Accounts whose interval elapsed or that asked for a sync.
    ///
    /// The interval runs from the last cycle that ended, so a failing
    /// account waits like a healthy one.
    pub fn due_accounts(&self) -> SyncResult<Vec<String>> {
        let store = self.orchestrator.store();
        let now = self.orchestrator.now();
        let interval = self.orchestrator.config().sync_interval();

        let mut due = Vec::new();
        for account in store.list_accounts()? {
            let state = store
                .get_sync_state(&account.id)?
                .unwrap_or_else(|| SyncState::new(&account.id));
            let last_cycle = state.last_attempt_at.or(state.last_sync_at);
            if state.sync_requested || interval_elapsed(last_cycle, interval, now) {
                due.push(account.id);
            }
        }
        Ok(due)
    }

    /// One scheduled pass over every due account
    pub fn run_due(&self) -> SyncResult<FleetSummary> {
        let due = self.due_accounts()?;
        if due.is_empty() {
            return Ok(FleetSummary::default());
        }
        info!("Syncing {} due accounts", due.len());
        Ok(self.run_accounts(&due))
    }

    /// Run the given accounts now, regardless of their interval
    pub fn run_accounts(&self, account_ids: &[String]) -> FleetSummary {
        let reports: Vec<CycleReport> = self.pool.install(|| {
            account_ids
                .par_iter()
                .map(|id| self.orchestrator.run_cycle(id))
                .collect()
        });

        let summary = FleetSummary::from_reports(&reports);
        if summary.failed > 0 {
            warn!(
                "Fleet pass: {} of {} accounts failed",
                summary.failed, summary.accounts_processed
            );
        }
        info!(
            "Fleet pass: {} processed, {} created, {} updated",
            summary.accounts_processed, summary.new_records_created, summary.records_updated
        );
        summary
    }
}
