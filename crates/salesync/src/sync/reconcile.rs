//! Reconciliation of candidate events into canonical sale records
//!
//! Candidates are grouped by transaction id. A pending shipment with a
//! matching funds transfer becomes a completed sale; a pending shipment past
//! its ship-by date is assumed completed on that date when deadline inference
//! is enabled.

use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SyncResult;
use crate::models::{CandidateEvent, Carrier, SaleRecord, SaleStatus};
use crate::storage::SalesStore;

/// What one reconciliation wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    /// Records completed from their deadline; also counted in created or updated
    pub expired: usize,
}

impl ReconcileStats {
    fn add(&mut self, other: ReconcileStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.expired += other.expired;
    }
}

enum Written {
    Created,
    Updated,
    Unchanged,
}

pub struct Reconciler<'a> {
    store: &'a dyn SalesStore,
    infer_completion_from_deadline: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn SalesStore, infer_completion_from_deadline: bool) -> Self {
        Self {
            store,
            infer_completion_from_deadline,
        }
    }

    /// Merge this cycle's candidates into the store
    pub fn reconcile(
        &self,
        account_id: &str,
        pending: &[CandidateEvent],
        completed: &[CandidateEvent],
        now: DateTime<Utc>,
    ) -> SyncResult<ReconcileStats> {
        let mut completed_by_tx = group_by_transaction(completed);
        let pending_by_tx = group_by_transaction(pending);
        let today = now.date_naive();
        let mut stats = ReconcileStats::default();

        for (tx, shipments) in &pending_by_tx {
            let transfers = completed_by_tx.remove(tx);
            let mut record = pending_record(account_id, tx, shipments, now);
            let mut inferred = false;

            if let Some(transfers) = transfers {
                complete_with_transfers(&mut record, &transfers);
            } else if self.should_infer(&record, today)
                && !self.already_settled(account_id, tx)?
            {
                record.status = SaleStatus::Completed;
                record.completion_date = record.deadline;
                inferred = true;
            }

            self.write(record, inferred, now, &mut stats)?;
        }

        // Transfers whose label email was never seen
        for (tx, transfers) in completed_by_tx {
            let mut record = pending_record(account_id, &tx, &transfers, now);
            record.carrier = Carrier::Unknown;
            record.tracking_ref = None;
            record.deadline = None;
            complete_with_transfers(&mut record, &transfers);
            self.write(record, false, now, &mut stats)?;
        }

        Ok(stats)
    }

    /// Complete stored pending records whose deadline passed without a
    /// matching transfer arriving
    pub fn sweep_overdue(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        if !self.infer_completion_from_deadline {
            return Ok(stats);
        }

        for stored in self.store.list_overdue_pending(account_id, now.date_naive())? {
            let record = SaleRecord {
                status: SaleStatus::Completed,
                completion_date: stored.deadline,
                ..stored
            };
            self.write(record, true, now, &mut stats)?;
        }
        Ok(stats)
    }

    /// Reconcile then sweep, as one cycle does
    pub fn reconcile_and_sweep(
        &self,
        account_id: &str,
        pending: &[CandidateEvent],
        completed: &[CandidateEvent],
        now: DateTime<Utc>,
    ) -> SyncResult<ReconcileStats> {
        let mut stats = self.reconcile(account_id, pending, completed, now)?;
        stats.add(self.sweep_overdue(account_id, now)?);
        Ok(stats)
    }

    fn should_infer(&self, record: &SaleRecord, today: NaiveDate) -> bool {
        self.infer_completion_from_deadline && record.deadline.is_some_and(|d| today > d)
    }

    /// A record already completed must keep its real completion date
    fn already_settled(&self, account_id: &str, tx: &str) -> SyncResult<bool> {
        Ok(self
            .store
            .get_sale(account_id, tx)?
            .is_some_and(|r| r.status != SaleStatus::Pending))
    }

    fn write(
        &self,
        record: SaleRecord,
        inferred: bool,
        now: DateTime<Utc>,
        stats: &mut ReconcileStats,
    ) -> SyncResult<()> {
        let tx = record.transaction_id.clone();
        let written = match self.store.upsert_sale(record, now)? {
            None => Written::Unchanged,
            Some(r) if r.created_at == r.updated_at => Written::Created,
            Some(_) => Written::Updated,
        };

        match written {
            Written::Created => stats.created += 1,
            Written::Updated => stats.updated += 1,
            Written::Unchanged => {
                debug!("Sale {} unchanged", tx);
                return Ok(());
            }
        }
        if inferred {
            debug!("Sale {} completed from its deadline", tx);
            stats.expired += 1;
        }
        Ok(())
    }
}

fn group_by_transaction(events: &[CandidateEvent]) -> BTreeMap<String, Vec<&CandidateEvent>> {
    let mut groups: BTreeMap<String, Vec<&CandidateEvent>> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.transaction_id.clone())
            .or_default()
            .push(event);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|e| e.event_date);
    }
    groups
}

/// Pending record from one transaction's events, oldest first
fn pending_record(
    account_id: &str,
    transaction_id: &str,
    events: &[&CandidateEvent],
    now: DateTime<Utc>,
) -> SaleRecord {
    let first = |f: fn(&CandidateEvent) -> bool| events.iter().find(|e| f(e)).copied();

    SaleRecord {
        account_id: account_id.to_string(),
        transaction_id: transaction_id.to_string(),
        status: SaleStatus::Pending,
        item: first(|e| e.item.is_some()).and_then(|e| e.item.clone()),
        amount: 0.0,
        purchase_cost: None,
        carrier: first(|e| e.carrier.is_known())
            .map(|e| e.carrier)
            .unwrap_or(Carrier::Unknown),
        tracking_ref: first(|e| e.tracking_ref.is_some()).and_then(|e| e.tracking_ref.clone()),
        sale_date: events.first().map(|e| e.event_date).unwrap_or(now),
        completion_date: None,
        deadline: first(|e| e.deadline.is_some()).and_then(|e| e.deadline),
        message_ids: events.iter().map(|e| e.message_id.clone()).collect::<BTreeSet<_>>(),
        manual: false,
        created_at: now,
        updated_at: now,
    }
}

/// Apply the earliest transfer's date and the first stated amount
fn complete_with_transfers(record: &mut SaleRecord, transfers: &[&CandidateEvent]) {
    record.status = SaleStatus::Completed;
    record.completion_date = transfers.first().map(|e| e.event_date.date_naive());
    record.amount = transfers.iter().find_map(|e| e.amount).unwrap_or(0.0);
    if record.item.is_none() {
        record.item = transfers.iter().find_map(|e| e.item.clone());
    }
    record
        .message_ids
        .extend(transfers.iter().map(|e| e.message_id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateKind, MessageId};
    use crate::storage::InMemorySalesStore;
    use chrono::{Duration, TimeZone};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn pending(tx: &str, msg: &str, deadline: Option<NaiveDate>) -> CandidateEvent {
        CandidateEvent {
            kind: CandidateKind::PendingShipment,
            transaction_id: tx.to_string(),
            item: Some("Jacket".into()),
            amount: None,
            carrier: Carrier::MondialRelay,
            tracking_ref: Some("12345678".into()),
            deadline,
            message_id: MessageId::new(msg),
            snippet: String::new(),
            confidence: 1.0,
            event_date: at(2),
        }
    }

    fn completed(tx: &str, msg: &str, amount: f64, day: u32) -> CandidateEvent {
        CandidateEvent {
            kind: CandidateKind::CompletedTransfer,
            transaction_id: tx.to_string(),
            item: None,
            amount: Some(amount),
            carrier: Carrier::Unknown,
            tracking_ref: None,
            deadline: None,
            message_id: MessageId::new(msg),
            snippet: String::new(),
            confidence: 0.8,
            event_date: at(day),
        }
    }

    #[test]
    fn test_match_merge() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        let stats = reconciler
            .reconcile(
                "a1",
                &[pending("X1", "m1", Some(date(10)))],
                &[completed("X1", "m2", 42.5, 5)],
                at(6),
            )
            .unwrap();
        assert_eq!(stats, ReconcileStats { created: 1, updated: 0, expired: 0 });

        let record = store.get_sale("a1", "X1").unwrap().unwrap();
        assert_eq!(record.status, SaleStatus::Completed);
        assert_eq!(record.amount, 42.5);
        assert_eq!(record.completion_date, Some(date(5)));
        assert_eq!(record.carrier, Carrier::MondialRelay);
        assert_eq!(record.message_ids.len(), 2);
        assert_eq!(store.list_sales("a1").unwrap().len(), 1);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);
        let p = [pending("X1", "m1", Some(date(10)))];

        reconciler.reconcile("a1", &p, &[], at(6)).unwrap();
        let first = store.get_sale("a1", "X1").unwrap();

        let stats = reconciler.reconcile("a1", &p, &[], at(6) + Duration::hours(1)).unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert_eq!(store.get_sale("a1", "X1").unwrap(), first);
    }

    #[test]
    fn test_deadline_inference() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        let stats = reconciler
            .reconcile("a1", &[pending("X2", "m1", Some(date(3)))], &[], at(6))
            .unwrap();
        assert_eq!(stats, ReconcileStats { created: 1, updated: 0, expired: 1 });

        let record = store.get_sale("a1", "X2").unwrap().unwrap();
        assert_eq!(record.status, SaleStatus::Completed);
        assert_eq!(record.completion_date, Some(date(3)));
        assert_eq!(record.amount, 0.0);
    }

    #[test]
    fn test_deadline_today_is_not_passed() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);
        reconciler
            .reconcile("a1", &[pending("X2", "m1", Some(date(6)))], &[], at(6))
            .unwrap();
        assert_eq!(
            store.get_sale("a1", "X2").unwrap().unwrap().status,
            SaleStatus::Pending
        );
    }

    #[test]
    fn test_inference_disabled_keeps_pending() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, false);
        let stats = reconciler
            .reconcile("a1", &[pending("X2", "m1", Some(date(3)))], &[], at(6))
            .unwrap();
        assert_eq!(stats.expired, 0);
        assert_eq!(
            store.get_sale("a1", "X2").unwrap().unwrap().status,
            SaleStatus::Pending
        );
    }

    #[test]
    fn test_orphan_completed_has_unknown_carrier() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        let stats = reconciler
            .reconcile("a1", &[], &[completed("X3", "m7", 19.99, 4)], at(6))
            .unwrap();
        assert_eq!(stats.created, 1);

        let record = store.get_sale("a1", "X3").unwrap().unwrap();
        assert_eq!(record.status, SaleStatus::Completed);
        assert_eq!(record.carrier, Carrier::Unknown);
        assert_eq!(record.amount, 19.99);
        assert_eq!(record.completion_date, Some(date(4)));
    }

    #[test]
    fn test_late_transfer_updates_pending_record() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        reconciler
            .reconcile("a1", &[pending("X1", "m1", Some(date(10)))], &[], at(6))
            .unwrap();
        let stats = reconciler
            .reconcile("a1", &[], &[completed("X1", "m2", 42.5, 7)], at(7))
            .unwrap();
        assert_eq!(stats, ReconcileStats { created: 0, updated: 1, expired: 0 });

        let record = store.get_sale("a1", "X1").unwrap().unwrap();
        assert_eq!(record.status, SaleStatus::Completed);
        assert_eq!(record.amount, 42.5);
        // Known carrier survives the carrier-less transfer
        assert_eq!(record.carrier, Carrier::MondialRelay);
        assert_eq!(record.created_at, at(6));
        assert_eq!(record.updated_at, at(7));
    }

    #[test]
    fn test_resent_label_does_not_override_real_completion() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        reconciler
            .reconcile(
                "a1",
                &[pending("X1", "m1", Some(date(3)))],
                &[completed("X1", "m2", 42.5, 2)],
                at(2),
            )
            .unwrap();
        let stats = reconciler
            .reconcile("a1", &[pending("X1", "m1", Some(date(3)))], &[], at(6))
            .unwrap();
        assert_eq!(stats.expired, 0);

        let record = store.get_sale("a1", "X1").unwrap().unwrap();
        assert_eq!(record.completion_date, Some(date(2)));
        assert_eq!(record.amount, 42.5);
    }

    #[test]
    fn test_sweep_overdue() {
        let store = InMemorySalesStore::new();
        let reconciler = Reconciler::new(&store, true);

        reconciler
            .reconcile("a1", &[pending("X4", "m1", Some(date(5)))], &[], at(4))
            .unwrap();
        assert_eq!(reconciler.sweep_overdue("a1", at(5)).unwrap(), ReconcileStats::default());

        let stats = reconciler.sweep_overdue("a1", at(6)).unwrap();
        assert_eq!(stats, ReconcileStats { created: 0, updated: 1, expired: 1 });
        let record = store.get_sale("a1", "X4").unwrap().unwrap();
        assert_eq!(record.status, SaleStatus::Completed);
        assert_eq!(record.completion_date, Some(date(5)));
    }

    #[test]
    fn test_manual_records_untouched() {
        let store = InMemorySalesStore::new();
        let manual = SaleRecord::manual("a1", "X1", at(1), at(1));
        assert!(store.insert_sale_if_absent(&manual).unwrap());

        let reconciler = Reconciler::new(&store, true);
        let stats = reconciler
            .reconcile("a1", &[], &[completed("X1", "m2", 42.5, 5)], at(6))
            .unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert_eq!(store.get_sale("a1", "X1").unwrap().unwrap(), manual);
    }
}
