//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{Account, OAuthToken, SaleRecord, SaleStatus, SyncState};

/// Result of asking for an account's advisory lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    /// A stale holder was force-released first
    Recovered { previous_holder: String },
    /// Someone else holds a live lock
    Held {
        holder: String,
        since: Option<DateTime<Utc>>,
    },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockAcquisition::Held { .. })
    }
}

/// Advisory per-account lock with a TTL.
///
/// A lock older than `stale_after` counts as abandoned and may be taken over.
/// Acquisition must be atomic with respect to other processes sharing the
/// backend.
pub trait LockManager: Send + Sync {
    fn try_acquire_lock(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<LockAcquisition>;

    /// Refresh the acquisition time; false if `holder` no longer owns the lock
    fn renew_lock(&self, account_id: &str, holder: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Release the lock if `holder` still owns it
    fn release_lock(&self, account_id: &str, holder: &str) -> Result<()>;
}

/// Trait for sales storage operations
///
/// This trait abstracts over different storage backends (in-memory, SQLite)
/// and provides the operations the sync engine and the record editor need.
pub trait SalesStore: LockManager {
    // === Accounts ===

    /// Insert or update an account, including its token
    fn upsert_account(&self, account: Account) -> Result<()>;

    fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    /// All accounts, ordered by id
    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Replace the stored token of an existing account
    fn save_account_token(&self, account_id: &str, token: &OAuthToken) -> Result<()>;

    // === Sync state ===

    fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>>;

    /// Save sync state (upsert).
    ///
    /// Lock fields are owned by [`LockManager`] and are not written here.
    fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    /// Flag an account for sync on the next fleet pass regardless of interval.
    ///
    /// Touches only the request flag, creating the state row if needed.
    fn request_sync(&self, account_id: &str) -> Result<()>;

    /// Lift a pending reauthorization block and its error message
    fn clear_reauth(&self, account_id: &str) -> Result<()>;

    /// Store a fresh grant and lift a pending reauthorization block
    fn store_credentials(&self, account_id: &str, token: &OAuthToken) -> Result<()> {
        self.save_account_token(account_id, token)?;
        self.clear_reauth(account_id)
    }

    // === Sale records ===

    /// Merge a sync-produced record into the store.
    ///
    /// Returns the row as written, or `None` when nothing changed. Callers
    /// tell inserts from updates by its timestamps: an insert has
    /// `created_at == updated_at`.
    fn upsert_sale(&self, record: SaleRecord, now: DateTime<Utc>) -> Result<Option<SaleRecord>>;

    fn get_sale(&self, account_id: &str, transaction_id: &str) -> Result<Option<SaleRecord>>;

    /// All records of an account, ordered by sale date
    fn list_sales(&self, account_id: &str) -> Result<Vec<SaleRecord>>;

    /// Non-manual pending records whose deadline is before `today`
    fn list_overdue_pending(&self, account_id: &str, today: NaiveDate) -> Result<Vec<SaleRecord>>;

    /// Insert a record unless its transaction id is taken; false if it was
    fn insert_sale_if_absent(&self, record: &SaleRecord) -> Result<bool>;

    /// Overwrite a stored manual record; false if there is no manual record
    /// under that transaction id
    fn replace_manual_sale(&self, record: &SaleRecord) -> Result<bool>;

    /// Set the purchase cost, leaving every other field as stored.
    ///
    /// `updated_at` moves only when the cost changes. Returns the row as
    /// stored, or `None` when the record does not exist.
    fn set_purchase_cost(
        &self,
        account_id: &str,
        transaction_id: &str,
        cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<SaleRecord>>;

    /// Delete a record; false if it did not exist
    fn delete_sale(&self, account_id: &str, transaction_id: &str) -> Result<bool>;
}

/// Merge an incoming sync record into what is stored.
///
/// Returns the row to write, or `None` when the store must not change:
/// manual and cancelled records are left alone, and a merge that changes no
/// sync-owned field is a no-op. Both backends share this so upsert semantics
/// cannot drift between them.
pub(crate) fn merge_sale(
    existing: Option<&SaleRecord>,
    mut incoming: SaleRecord,
    now: DateTime<Utc>,
) -> Option<SaleRecord> {
    let Some(existing) = existing else {
        incoming.manual = false;
        incoming.created_at = now;
        incoming.updated_at = now;
        return Some(incoming);
    };

    if existing.manual || existing.status.is_terminal() {
        return None;
    }

    let status = if existing.status.can_advance_to(incoming.status) {
        incoming.status
    } else {
        existing.status
    };

    let mut message_ids = existing.message_ids.clone();
    message_ids.extend(incoming.message_ids);

    let merged = SaleRecord {
        account_id: existing.account_id.clone(),
        transaction_id: existing.transaction_id.clone(),
        status,
        item: incoming.item.or_else(|| existing.item.clone()),
        amount: if incoming.amount != 0.0 {
            incoming.amount
        } else {
            existing.amount
        },
        purchase_cost: existing.purchase_cost,
        carrier: if incoming.carrier.is_known() {
            incoming.carrier
        } else {
            existing.carrier
        },
        tracking_ref: incoming.tracking_ref.or_else(|| existing.tracking_ref.clone()),
        sale_date: existing.sale_date.min(incoming.sale_date),
        completion_date: match status {
            SaleStatus::Pending => None,
            _ => incoming.completion_date.or(existing.completion_date),
        },
        deadline: incoming.deadline.or(existing.deadline),
        message_ids,
        manual: false,
        created_at: existing.created_at,
        updated_at: existing.updated_at,
    };

    if merged.same_sync_fields(existing) {
        return None;
    }

    Some(SaleRecord {
        updated_at: now,
        ..merged
    })
}
