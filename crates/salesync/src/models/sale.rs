//! Canonical sale record, one per (account, transaction id)

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::MessageId;

/// Lifecycle of a sale.
///
/// Status only moves forward: pending → completed → cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Pending,
    Completed,
    Cancelled,
}

impl SaleStatus {
    fn rank(self) -> u8 {
        match self {
            SaleStatus::Pending => 0,
            SaleStatus::Completed => 1,
            SaleStatus::Cancelled => 2,
        }
    }

    /// Whether moving to `next` keeps the status monotonic
    pub fn can_advance_to(self, next: SaleStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self == SaleStatus::Cancelled
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Completed => "completed",
            SaleStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SaleStatus::Pending),
            "completed" => Some(SaleStatus::Completed),
            "cancelled" => Some(SaleStatus::Cancelled),
            _ => None,
        }
    }
}

/// Shipping carrier named in a label email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Carrier {
    MondialRelay,
    Colissimo,
    Chronopost,
    RelaisColis,
    Ups,
    Dhl,
    InPost,
    Unknown,
}

impl Carrier {
    pub const KNOWN: [Carrier; 7] = [
        Carrier::MondialRelay,
        Carrier::Colissimo,
        Carrier::Chronopost,
        Carrier::RelaisColis,
        Carrier::Ups,
        Carrier::Dhl,
        Carrier::InPost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::MondialRelay => "mondial_relay",
            Carrier::Colissimo => "colissimo",
            Carrier::Chronopost => "chronopost",
            Carrier::RelaisColis => "relais_colis",
            Carrier::Ups => "ups",
            Carrier::Dhl => "dhl",
            Carrier::InPost => "inpost",
            Carrier::Unknown => "unknown",
        }
    }

    /// Parse a stored carrier name; unrecognized names map to `Unknown`
    pub fn parse(s: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|c| c.as_str() == s)
            .unwrap_or(Carrier::Unknown)
    }

    pub fn is_known(&self) -> bool {
        *self != Carrier::Unknown
    }
}

/// The durable, deduplicated record a candidate event is merged into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub account_id: String,
    pub transaction_id: String,
    pub status: SaleStatus,
    pub item: Option<String>,
    /// Settled amount; 0 until a completed transfer is seen
    pub amount: f64,
    /// Seller's purchase cost, edited by the user only
    pub purchase_cost: Option<f64>,
    pub carrier: Carrier,
    pub tracking_ref: Option<String>,
    pub sale_date: DateTime<Utc>,
    pub completion_date: Option<NaiveDate>,
    /// Ship-by date from the label email
    pub deadline: Option<NaiveDate>,
    /// Messages this record was built from
    pub message_ids: BTreeSet<MessageId>,
    /// Created by the user rather than by sync
    pub manual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SaleRecord {
    /// Create a user-entered record
    pub fn manual(
        account_id: impl Into<String>,
        transaction_id: impl Into<String>,
        sale_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            transaction_id: transaction_id.into(),
            status: SaleStatus::Pending,
            item: None,
            amount: 0.0,
            purchase_cost: None,
            carrier: Carrier::Unknown,
            tracking_ref: None,
            sale_date,
            completion_date: None,
            deadline: None,
            message_ids: BTreeSet::new(),
            manual: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Margin between settled amount and purchase cost, if the cost is known
    pub fn profit(&self) -> Option<f64> {
        self.purchase_cost.map(|cost| self.amount - cost)
    }

    /// True when every sync-owned field matches `other`.
    ///
    /// Timestamps and the user-owned purchase cost are ignored.
    pub fn same_sync_fields(&self, other: &SaleRecord) -> bool {
        self.status == other.status
            && self.item == other.item
            && self.amount == other.amount
            && self.carrier == other.carrier
            && self.tracking_ref == other.tracking_ref
            && self.sale_date == other.sale_date
            && self.completion_date == other.completion_date
            && self.deadline == other.deadline
            && self.message_ids == other.message_ids
    }
}
