//! Sync timing utilities: interval scheduling and per-cycle deadlines
//!
//! Pure functions and small types that can be tested without a provider.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use super::session::Step;
use crate::error::{SyncError, SyncResult};

/// Check if enough time has elapsed since the last cycle to allow a new one.
///
/// # Arguments
/// * `last_cycle_at` - When the last cycle ended (None if never run)
/// * `interval` - Minimum time that must elapse between syncs
/// * `now` - Current time
///
/// # Returns
/// `true` if enough time has passed (or never synced), `false` otherwise
pub fn interval_elapsed(
    last_cycle_at: Option<DateTime<Utc>>,
    interval: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_cycle_at {
        Some(last) => now - last >= interval,
        None => true, // Never ran, so the interval has "elapsed"
    }
}

/// Wall-clock budget for one cycle.
///
/// Checked at every suspension point; exceeding it aborts the cycle at the
/// next external call rather than interrupting one in flight.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            expires_at: started + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail with `Timeout` if the budget is spent before `step` runs
    pub fn check(&self, step: Step) -> SyncResult<()> {
        if self.is_expired() {
            return Err(SyncError::Timeout { step: step.name() });
        }
        Ok(())
    }

    /// Sleep for `wait`, or fail if the budget would run out first
    pub fn sleep(&self, wait: Duration, step: Step) -> SyncResult<()> {
        if wait >= self.remaining() {
            return Err(SyncError::Timeout { step: step.name() });
        }
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(())
    }
}
