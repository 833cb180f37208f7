//! RAII guard over the per-account advisory lock

use chrono::{DateTime, Utc};
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SyncError, SyncResult};
use crate::storage::{LockAcquisition, LockManager};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Unique name for one cycle's claim on a lock
pub fn holder_id() -> String {
    format!(
        "pid{}-run{}",
        std::process::id(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Result of trying to take an account lock
pub enum LockAttempt<'a, L: LockManager + ?Sized> {
    Acquired(AccountLock<'a, L>),
    /// Another live cycle owns the account
    Held { holder: String },
}

/// Held account lock, released when dropped
pub struct AccountLock<'a, L: LockManager + ?Sized> {
    locks: &'a L,
    account_id: String,
    holder: String,
    recovered_from: Option<String>,
}

impl<'a, L: LockManager + ?Sized> AccountLock<'a, L> {
    pub fn try_acquire(
        locks: &'a L,
        account_id: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> SyncResult<LockAttempt<'a, L>> {
        let holder = holder_id();
        let recovered_from = match locks.try_acquire_lock(account_id, &holder, now, stale_after)? {
            LockAcquisition::Acquired => None,
            LockAcquisition::Recovered { previous_holder } => Some(previous_holder),
            LockAcquisition::Held { holder, .. } => return Ok(LockAttempt::Held { holder }),
        };

        Ok(LockAttempt::Acquired(AccountLock {
            locks,
            account_id: account_id.to_string(),
            holder,
            recovered_from,
        }))
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Previous holder, when a stale lock was taken over
    pub fn recovered_from(&self) -> Option<&str> {
        self.recovered_from.as_deref()
    }

    /// Push the TTL forward; fails if the lock was taken over meanwhile
    pub fn renew(&self, now: DateTime<Utc>) -> SyncResult<()> {
        if self.locks.renew_lock(&self.account_id, &self.holder, now)? {
            Ok(())
        } else {
            Err(SyncError::Storage(anyhow::anyhow!(
                "lock on {} lost by {}",
                self.account_id,
                self.holder
            )))
        }
    }
}

impl<L: LockManager + ?Sized> Drop for AccountLock<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release_lock(&self.account_id, &self.holder) {
            warn!("[{}] failed to release lock: {:#}", self.account_id, e);
        }
    }
}
