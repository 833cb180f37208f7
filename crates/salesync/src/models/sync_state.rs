//! Per-account sync state for incremental Gmail sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HistoryCursor;

/// Tracks sync progress for one account.
///
/// Persisted separately from sale records. Only the orchestrator mutates it,
/// and only while holding the account lock; the lock fields themselves are
/// written through [`crate::storage::LockManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub account_id: String,
    /// Gmail historyId after the last successful reconciliation
    pub cursor: Option<HistoryCursor>,
    /// When we last successfully synced
    pub last_sync_at: Option<DateTime<Utc>>,
    /// When the last cycle ended, successful or not
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Holder of the advisory lock, if any
    pub lock_holder: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    /// Cycles are skipped until this instant
    pub paused_until: Option<DateTime<Utc>>,
    /// Set when the grant was revoked; cleared when new credentials arrive
    pub reauth_required: bool,
    /// A user asked for a sync outside the regular interval
    pub sync_requested: bool,
    /// User-safe description of the last failure
    pub last_error: Option<String>,
    pub total_cycles: u64,
    pub total_failures: u64,
    pub total_created: u64,
    pub total_updated: u64,
}

impl SyncState {
    /// Fresh state created on the first sync attempt
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            cursor: None,
            last_sync_at: None,
            last_attempt_at: None,
            lock_holder: None,
            lock_acquired_at: None,
            consecutive_errors: 0,
            paused_until: None,
            reauth_required: false,
            sync_requested: false,
            last_error: None,
            total_cycles: 0,
            total_failures: 0,
            total_created: 0,
            total_updated: 0,
        }
    }

    /// Whether cycles are suspended at `now`
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// Record a successful cycle: advance the cursor and reset error tracking
    pub fn committed(
        mut self,
        cursor: HistoryCursor,
        now: DateTime<Utc>,
        created: usize,
        updated: usize,
    ) -> Self {
        self.cursor = Some(cursor);
        self.last_sync_at = Some(now);
        self.last_attempt_at = Some(now);
        self.consecutive_errors = 0;
        self.paused_until = None;
        self.sync_requested = false;
        self.last_error = None;
        self.total_cycles += 1;
        self.total_created += created as u64;
        self.total_updated += updated as u64;
        self
    }

    /// Record a failed cycle.
    ///
    /// Returns true when this failure made the counter reach `threshold`, so
    /// the caller can report the crossing exactly once.
    pub fn record_failure(
        &mut self,
        message: String,
        now: DateTime<Utc>,
        threshold: u32,
        cooldown: chrono::Duration,
    ) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.total_cycles += 1;
        self.total_failures += 1;
        self.last_error = Some(message);
        self.last_attempt_at = Some(now);

        if threshold > 0 && self.consecutive_errors >= threshold {
            self.paused_until = Some(now + cooldown);
        }
        threshold > 0 && self.consecutive_errors == threshold
    }

    /// Whether the lock is held at `now`, ignoring holders older than `stale_after`
    pub fn lock_is_live(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match (&self.lock_holder, self.lock_acquired_at) {
            (Some(_), Some(at)) => now - at < stale_after,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_sync_state() {
        let state = SyncState::new("a1");
        assert_eq!(state.account_id, "a1");
        assert!(state.cursor.is_none());
        assert_eq!(state.consecutive_errors, 0);
    }

    #[test]
    fn test_committed_resets_errors() {
        let now = Utc::now();
        let mut state = SyncState::new("a1");
        state.consecutive_errors = 2;
        state.sync_requested = true;
        let state = state.committed(HistoryCursor::new("200"), now, 3, 1);
        assert_eq!(state.cursor, Some(HistoryCursor::new("200")));
        assert_eq!(state.consecutive_errors, 0);
        assert!(!state.sync_requested);
        assert_eq!(state.total_created, 3);
        assert_eq!(state.total_updated, 1);
    }

    #[test]
    fn test_record_failure_reports_crossing_once() {
        let now = Utc::now();
        let mut state = SyncState::new("a1");
        let cooldown = Duration::minutes(30);

        assert!(!state.record_failure("e".into(), now, 3, cooldown));
        assert!(!state.record_failure("e".into(), now, 3, cooldown));
        assert!(!state.is_paused(now));
        assert!(state.record_failure("e".into(), now, 3, cooldown));
        assert!(state.is_paused(now));
        // Further failures keep the pause but do not report again
        assert!(!state.record_failure("e".into(), now, 3, cooldown));
        assert!(!state.is_paused(now + Duration::minutes(31)));
    }

    #[test]
    fn test_failure_stamps_attempt_not_sync() {
        let now = Utc::now();
        let mut state = SyncState::new("a1");
        state.record_failure("e".into(), now, 3, Duration::minutes(30));
        assert_eq!(state.last_attempt_at, Some(now));
        assert!(state.last_sync_at.is_none());
    }

    #[test]
    fn test_lock_is_live() {
        let now = Utc::now();
        let mut state = SyncState::new("a1");
        assert!(!state.lock_is_live(now, Duration::minutes(10)));

        state.lock_holder = Some("run-1".into());
        state.lock_acquired_at = Some(now - Duration::minutes(5));
        assert!(state.lock_is_live(now, Duration::minutes(10)));
        assert!(!state.lock_is_live(now, Duration::minutes(4)));
    }

    #[test]
    fn test_serialization() {
        let state = SyncState::new("a1").committed(HistoryCursor::new("9"), Utc::now(), 0, 0);
        let json = serde_json::to_string(&state).unwrap();
        let back: SyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
