//! Salesync - incremental mailbox sync for marketplace sellers
//!
//! This crate turns a seller's Gmail mailbox into a ledger of sales:
//! - Gmail API client and OAuth credential management
//! - Change-log fetching with a full-window fallback
//! - Rule-based classification of label and funds-transfer emails
//! - Idempotent reconciliation into one record per transaction
//! - Per-account orchestration with locks, retries, quota and cooldown
//! - Storage trait abstractions with in-memory and SQLite backends
//!
//! The crate has no async runtime dependency; the daemon drives it from
//! blocking worker threads.

pub mod clock;
pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod quota;
pub mod records;
pub mod report;
pub mod storage;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GmailCredentials, SyncConfig};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use gmail::{CredentialManager, GmailClient, GoogleOAuth, MailProvider, TokenRefresher};
pub use models::{
    Account, CandidateEvent, CandidateKind, Carrier, EmailAddress, HistoryCursor, MailMessage,
    MessageId, OAuthToken, SaleRecord, SaleStatus, SyncState,
};
pub use quota::{ApiMethod, QuotaGovernor, QuotaSnapshot};
pub use records::{ManualSale, RecordEditor};
pub use report::{LogReporter, Reporter, SyncEvent};
pub use storage::{InMemorySalesStore, LockAcquisition, LockManager, SalesStore, SqliteSalesStore};
pub use sync::{
    CycleOutcome, CycleReport, CycleStats, FleetDriver, FleetSummary, Orchestrator, SkipReason,
    SyncPhase,
};
