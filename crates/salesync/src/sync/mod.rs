//! Sync engine: fetch mailbox changes, classify them, reconcile sale records
//!
//! Cycles are idempotent and can be safely retried. A cycle that fails before
//! committing leaves the cursor where it was, so the next cycle sees the same
//! changes again and the upserts converge on the same records.

mod classifier;
mod fetcher;
mod fleet;
mod lock;
mod orchestrator;
mod reconcile;
mod retry;
mod session;
mod timing;

pub use classifier::{BatchResult, Classification, MessageClassifier, SIGNATURES, Signature};
pub use fetcher::{ChangeLogFetcher, ChangeSet, WindowScan};
pub use fleet::{FleetDriver, FleetSummary, MAX_SUMMARY_ERRORS};
pub use lock::{AccountLock, LockAttempt};
pub use orchestrator::{
    CycleOutcome, CycleReport, CycleStats, Orchestrator, SkipReason, SyncPhase,
};
pub use reconcile::{ReconcileStats, Reconciler};
pub use retry::RetryPolicy;
pub use session::{ProviderSession, Step};
pub use timing::{Deadline, interval_elapsed};
