//! User edits to sale records
//!
//! Manual records belong to the user. Records built by sync belong to sync,
//! except for the purchase cost, which only the user knows.

use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::models::{Carrier, SaleRecord, SaleStatus};
use crate::storage::SalesStore;

/// User-entered fields of a manual record
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManualSale {
    pub status: SaleStatus,
    pub item: Option<String>,
    #[serde(default)]
    pub amount: f64,
    pub purchase_cost: Option<f64>,
    #[serde(default = "unknown_carrier")]
    pub carrier: Carrier,
    pub tracking_ref: Option<String>,
    pub sale_date: DateTime<Utc>,
    pub completion_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
}

fn unknown_carrier() -> Carrier {
    Carrier::Unknown
}

impl ManualSale {
    fn apply(self, record: &mut SaleRecord) {
        record.status = self.status;
        record.item = self.item;
        record.amount = self.amount;
        record.purchase_cost = self.purchase_cost;
        record.carrier = self.carrier;
        record.tracking_ref = self.tracking_ref;
        record.sale_date = self.sale_date;
        record.completion_date = match self.status {
            SaleStatus::Pending => None,
            _ => self.completion_date,
        };
        record.deadline = self.deadline;
    }
}

pub struct RecordEditor<'a> {
    store: &'a dyn SalesStore,
}

impl<'a> RecordEditor<'a> {
    pub fn new(store: &'a dyn SalesStore) -> Self {
        Self { store }
    }

    /// Add a record by hand; the transaction id must be free
    pub fn create_manual(
        &self,
        account_id: &str,
        transaction_id: &str,
        sale: ManualSale,
        now: DateTime<Utc>,
    ) -> SyncResult<SaleRecord> {
        let mut record = SaleRecord::manual(account_id, transaction_id, sale.sale_date, now);
        sale.apply(&mut record);
        if !self.store.insert_sale_if_absent(&record)? {
            return Err(SyncError::RecordNotEditable {
                transaction_id: transaction_id.to_string(),
            });
        }
        info!("[{}] created manual sale {}", account_id, transaction_id);
        Ok(record)
    }

    /// Replace every user field of a manual record
    pub fn edit_manual(
        &self,
        account_id: &str,
        transaction_id: &str,
        sale: ManualSale,
        now: DateTime<Utc>,
    ) -> SyncResult<SaleRecord> {
        let mut record = self.manual_record(account_id, transaction_id)?;
        sale.apply(&mut record);
        record.updated_at = now;
        // Deleted since it was read
        if !self.store.replace_manual_sale(&record)? {
            return Err(SyncError::RecordNotFound {
                transaction_id: transaction_id.to_string(),
            });
        }
        Ok(record)
    }

    pub fn delete_manual(&self, account_id: &str, transaction_id: &str) -> SyncResult<()> {
        self.manual_record(account_id, transaction_id)?;
        self.store.delete_sale(account_id, transaction_id)?;
        info!("[{}] deleted manual sale {}", account_id, transaction_id);
        Ok(())
    }

    /// Set or clear the purchase cost; allowed on every record
    pub fn set_purchase_cost(
        &self,
        account_id: &str,
        transaction_id: &str,
        cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> SyncResult<SaleRecord> {
        self.store
            .set_purchase_cost(account_id, transaction_id, cost, now)?
            .ok_or_else(|| SyncError::RecordNotFound {
                transaction_id: transaction_id.to_string(),
            })
    }

    fn existing(&self, account_id: &str, transaction_id: &str) -> SyncResult<SaleRecord> {
        self.store
            .get_sale(account_id, transaction_id)?
            .ok_or_else(|| SyncError::RecordNotFound {
                transaction_id: transaction_id.to_string(),
            })
    }

    fn manual_record(&self, account_id: &str, transaction_id: &str) -> SyncResult<SaleRecord> {
        let record = self.existing(account_id, transaction_id)?;
        if !record.manual {
            return Err(SyncError::RecordNotEditable {
                transaction_id: transaction_id.to_string(),
            });
        }
        Ok(record)
    }
}
