//! Candidate events extracted from single messages

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{Carrier, MessageId};

/// What a classified message says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    /// A shipping label was created; the item still has to be shipped
    PendingShipment,
    /// The buyer's funds were transferred to the seller
    CompletedTransfer,
}

/// A provisional classification result.
///
/// Produced per sync run and consumed by the reconciler; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub kind: CandidateKind,
    pub transaction_id: String,
    pub item: Option<String>,
    /// Settled amount; usually absent on pending shipments
    pub amount: Option<f64>,
    pub carrier: Carrier,
    pub tracking_ref: Option<String>,
    /// Ship-by date announced with the label
    pub deadline: Option<NaiveDate>,
    pub message_id: MessageId,
    pub snippet: String,
    /// Weighted share of fields the rules could extract, in [0, 1]
    pub confidence: f32,
    /// When the source message was received
    pub event_date: DateTime<Utc>,
}

impl CandidateEvent {
    pub fn is_pending(&self) -> bool {
        self.kind == CandidateKind::PendingShipment
    }
}
