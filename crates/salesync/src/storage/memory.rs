//! In-memory storage implementation
//!
//! Used by tests and for dry runs; nothing survives a restart.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{LockAcquisition, LockManager, SalesStore, merge_sale};
use crate::models::{Account, OAuthToken, SaleRecord, SaleStatus, SyncState};

/// In-memory implementation of [`SalesStore`]
///
/// Uses maps protected by RwLocks for thread-safe access. Lock acquisition
/// takes the sync-state write lock, which makes it atomic across threads.
pub struct InMemorySalesStore {
    accounts: RwLock<BTreeMap<String, Account>>,
    sync_states: RwLock<HashMap<String, SyncState>>,
    /// Keyed by (account id, transaction id)
    sales: RwLock<BTreeMap<(String, String), SaleRecord>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn sale_key(account_id: &str, transaction_id: &str) -> (String, String) {
    (account_id.to_string(), transaction_id.to_string())
}

impl InMemorySalesStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            sync_states: RwLock::new(HashMap::new()),
            sales: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemorySalesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for InMemorySalesStore {
    fn try_acquire_lock(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<LockAcquisition> {
        let mut states = write(&self.sync_states)?;
        let state = states
            .entry(account_id.to_string())
            .or_insert_with(|| SyncState::new(account_id));

        let outcome = match state.lock_holder.as_deref() {
            Some(current) if current != holder && state.lock_is_live(now, stale_after) => {
                return Ok(LockAcquisition::Held {
                    holder: current.to_string(),
                    since: state.lock_acquired_at,
                });
            }
            Some(current) if current != holder => LockAcquisition::Recovered {
                previous_holder: current.to_string(),
            },
            _ => LockAcquisition::Acquired,
        };

        state.lock_holder = Some(holder.to_string());
        state.lock_acquired_at = Some(now);
        Ok(outcome)
    }

    fn renew_lock(&self, account_id: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut states = write(&self.sync_states)?;
        match states.get_mut(account_id) {
            Some(state) if state.lock_holder.as_deref() == Some(holder) => {
                state.lock_acquired_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_lock(&self, account_id: &str, holder: &str) -> Result<()> {
        let mut states = write(&self.sync_states)?;
        if let Some(state) = states.get_mut(account_id)
            && state.lock_holder.as_deref() == Some(holder)
        {
            state.lock_holder = None;
            state.lock_acquired_at = None;
        }
        Ok(())
    }
}

impl SalesStore for InMemorySalesStore {
    fn upsert_account(&self, account: Account) -> Result<()> {
        write(&self.accounts)?.insert(account.id.clone(), account);
        Ok(())
    }

    fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(read(&self.accounts)?.get(account_id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(read(&self.accounts)?.values().cloned().collect())
    }

    fn save_account_token(&self, account_id: &str, token: &OAuthToken) -> Result<()> {
        let mut accounts = write(&self.accounts)?;
        let Some(account) = accounts.get_mut(account_id) else {
            bail!("Account {} not found", account_id);
        };
        account.token = Some(token.clone());
        Ok(())
    }

    fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>> {
        Ok(read(&self.sync_states)?.get(account_id).cloned())
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let mut states = write(&self.sync_states)?;
        let (holder, acquired_at) = states
            .get(&state.account_id)
            .map(|s| (s.lock_holder.clone(), s.lock_acquired_at))
            .unwrap_or_default();

        let mut state = state.clone();
        state.lock_holder = holder;
        state.lock_acquired_at = acquired_at;
        states.insert(state.account_id.clone(), state);
        Ok(())
    }

    fn request_sync(&self, account_id: &str) -> Result<()> {
        write(&self.sync_states)?
            .entry(account_id.to_string())
            .or_insert_with(|| SyncState::new(account_id))
            .sync_requested = true;
        Ok(())
    }

    fn clear_reauth(&self, account_id: &str) -> Result<()> {
        if let Some(state) = write(&self.sync_states)?.get_mut(account_id) {
            state.reauth_required = false;
            state.last_error = None;
        }
        Ok(())
    }

    fn upsert_sale(&self, record: SaleRecord, now: DateTime<Utc>) -> Result<Option<SaleRecord>> {
        let key = sale_key(&record.account_id, &record.transaction_id);
        let mut sales = write(&self.sales)?;

        let merged = merge_sale(sales.get(&key), record, now);
        if let Some(merged) = &merged {
            sales.insert(key, merged.clone());
        }
        Ok(merged)
    }

    fn get_sale(&self, account_id: &str, transaction_id: &str) -> Result<Option<SaleRecord>> {
        Ok(read(&self.sales)?
            .get(&sale_key(account_id, transaction_id))
            .cloned())
    }

    fn list_sales(&self, account_id: &str) -> Result<Vec<SaleRecord>> {
        let mut records: Vec<SaleRecord> = read(&self.sales)?
            .values()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.sale_date
                .cmp(&b.sale_date)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        Ok(records)
    }

    fn list_overdue_pending(&self, account_id: &str, today: NaiveDate) -> Result<Vec<SaleRecord>> {
        Ok(read(&self.sales)?
            .values()
            .filter(|r| {
                r.account_id == account_id
                    && !r.manual
                    && r.status == SaleStatus::Pending
                    && r.deadline.is_some_and(|d| d < today)
            })
            .cloned()
            .collect())
    }

    fn insert_sale_if_absent(&self, record: &SaleRecord) -> Result<bool> {
        let mut sales = write(&self.sales)?;
        match sales.entry(sale_key(&record.account_id, &record.transaction_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    fn replace_manual_sale(&self, record: &SaleRecord) -> Result<bool> {
        let mut sales = write(&self.sales)?;
        match sales.get_mut(&sale_key(&record.account_id, &record.transaction_id)) {
            Some(stored) if stored.manual && record.manual => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_purchase_cost(
        &self,
        account_id: &str,
        transaction_id: &str,
        cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<SaleRecord>> {
        let mut sales = write(&self.sales)?;
        let Some(stored) = sales.get_mut(&sale_key(account_id, transaction_id)) else {
            return Ok(None);
        };
        if stored.purchase_cost != cost {
            stored.purchase_cost = cost;
            stored.updated_at = now;
        }
        Ok(Some(stored.clone()))
    }

    fn delete_sale(&self, account_id: &str, transaction_id: &str) -> Result<bool> {
        Ok(write(&self.sales)?
            .remove(&sale_key(account_id, transaction_id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
    }

    fn pending(tx: &str, deadline: Option<NaiveDate>) -> SaleRecord {
        let mut r = SaleRecord::manual("a1", tx, now(), now());
        r.manual = false;
        r.deadline = deadline;
        r
    }

    #[test]
    fn test_lock_exclusivity() {
        let store = InMemorySalesStore::new();
        let stale = Duration::minutes(10);

        assert_eq!(
            store.try_acquire_lock("a1", "run-1", now(), stale).unwrap(),
            LockAcquisition::Acquired
        );
        let second = store.try_acquire_lock("a1", "run-2", now(), stale).unwrap();
        assert!(matches!(second, LockAcquisition::Held { ref holder, .. } if holder == "run-1"));

        store.release_lock("a1", "run-1").unwrap();
        assert!(
            store
                .try_acquire_lock("a1", "run-2", now(), stale)
                .unwrap()
                .is_acquired()
        );
    }

    #[test]
    fn test_stale_lock_recovery() {
        let store = InMemorySalesStore::new();
        let stale = Duration::minutes(10);
        store.try_acquire_lock("a1", "crashed", now(), stale).unwrap();

        let later = now() + Duration::minutes(11);
        assert_eq!(
            store.try_acquire_lock("a1", "run-2", later, stale).unwrap(),
            LockAcquisition::Recovered {
                previous_holder: "crashed".into()
            }
        );
        // The crashed run can no longer renew or release
        assert!(!store.renew_lock("a1", "crashed", later).unwrap());
        store.release_lock("a1", "crashed").unwrap();
        let state = store.get_sync_state("a1").unwrap().unwrap();
        assert_eq!(state.lock_holder.as_deref(), Some("run-2"));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(InMemorySalesStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .try_acquire_lock("a1", &format!("run-{}", i), now(), Duration::minutes(10))
                        .unwrap()
                        .is_acquired()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_save_sync_state_keeps_lock_fields() {
        let store = InMemorySalesStore::new();
        store
            .try_acquire_lock("a1", "run-1", now(), Duration::minutes(10))
            .unwrap();

        let mut state = SyncState::new("a1");
        state.consecutive_errors = 2;
        store.save_sync_state(&state).unwrap();

        let stored = store.get_sync_state("a1").unwrap().unwrap();
        assert_eq!(stored.consecutive_errors, 2);
        assert_eq!(stored.lock_holder.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = InMemorySalesStore::new();
        let first = store.upsert_sale(pending("X1", None), now()).unwrap().unwrap();
        assert_eq!(first.created_at, now());

        let later = now() + Duration::minutes(15);
        assert!(store.upsert_sale(pending("X1", None), later).unwrap().is_none());
        assert_eq!(store.list_sales("a1").unwrap(), vec![first]);
    }

    #[test]
    fn test_list_overdue_pending() {
        let store = InMemorySalesStore::new();
        let today = now().date_naive();
        store
            .upsert_sale(pending("late", Some(today - Duration::days(1))), now())
            .unwrap();
        store
            .upsert_sale(pending("due-today", Some(today)), now())
            .unwrap();
        store.upsert_sale(pending("no-deadline", None), now()).unwrap();

        let overdue = store.list_overdue_pending("a1", today).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].transaction_id, "late");
    }

    #[test]
    fn test_store_credentials_clears_reauth() {
        let store = InMemorySalesStore::new();
        store
            .upsert_account(Account::new("a1", "seller@example.com"))
            .unwrap();
        let mut state = SyncState::new("a1");
        state.reauth_required = true;
        store.save_sync_state(&state).unwrap();

        let token = OAuthToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: None,
        };
        store.store_credentials("a1", &token).unwrap();

        assert!(!store.get_sync_state("a1").unwrap().unwrap().reauth_required);
        assert_eq!(store.get_account("a1").unwrap().unwrap().token, Some(token));
    }

    #[test]
    fn test_request_sync_touches_only_the_flag() {
        let store = InMemorySalesStore::new();
        store.request_sync("new").unwrap();
        assert!(store.get_sync_state("new").unwrap().unwrap().sync_requested);

        // A cycle commits after the caller last looked at the state
        let committed =
            SyncState::new("a1").committed(crate::models::HistoryCursor::new("200"), now(), 2, 0);
        store.save_sync_state(&committed).unwrap();
        store.request_sync("a1").unwrap();

        let stored = store.get_sync_state("a1").unwrap().unwrap();
        assert!(stored.sync_requested);
        assert_eq!(stored.cursor, committed.cursor);
        assert_eq!(stored.total_created, 2);
    }

    #[test]
    fn test_manual_writes_respect_ownership() {
        let store = InMemorySalesStore::new();
        store.upsert_sale(pending("S1", None), now()).unwrap();

        let manual = SaleRecord::manual("a1", "S1", now(), now());
        assert!(!store.insert_sale_if_absent(&manual).unwrap());
        assert!(!store.replace_manual_sale(&manual).unwrap());
        assert!(!store.get_sale("a1", "S1").unwrap().unwrap().manual);

        let manual = SaleRecord::manual("a1", "M1", now(), now());
        assert!(store.insert_sale_if_absent(&manual).unwrap());
        let mut edited = manual.clone();
        edited.amount = 12.0;
        assert!(store.replace_manual_sale(&edited).unwrap());
        assert_eq!(store.get_sale("a1", "M1").unwrap().unwrap().amount, 12.0);
    }

    #[test]
    fn test_set_purchase_cost_keeps_sync_fields() {
        let store = InMemorySalesStore::new();
        store.upsert_sale(pending("S1", None), now()).unwrap();
        let mut completed = pending("S1", None);
        completed.status = SaleStatus::Completed;
        completed.amount = 42.5;
        store.upsert_sale(completed, now()).unwrap();

        let later = now() + Duration::minutes(5);
        let stored = store.set_purchase_cost("a1", "S1", Some(10.0), later).unwrap().unwrap();
        assert_eq!(stored.status, SaleStatus::Completed);
        assert_eq!(stored.amount, 42.5);
        assert_eq!(stored.purchase_cost, Some(10.0));
        assert_eq!(stored.updated_at, later);

        // Same value: no write
        let unchanged = store
            .set_purchase_cost("a1", "S1", Some(10.0), later + Duration::minutes(1))
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.updated_at, later);
        assert!(store.set_purchase_cost("a1", "nope", None, later).unwrap().is_none());
    }
}
