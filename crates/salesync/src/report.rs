//! Event reporting interface consumed by the orchestrator
//!
//! The engine never talks to a logger or metrics registry directly; it emits
//! [`SyncEvent`]s to whatever [`Reporter`] it was constructed with.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::ErrorKind;
use crate::models::MessageId;
use crate::sync::{CycleStats, SkipReason, SyncPhase};

/// Something observable that happened during a sync cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PhaseEntered {
        account_id: String,
        phase: SyncPhase,
    },
    CycleSkipped {
        account_id: String,
        reason: SkipReason,
    },
    /// A stale lock was force-released before this cycle took it
    LockRecovered {
        account_id: String,
        previous_holder: String,
    },
    /// Incremental history was unusable; the full-window search ran instead
    FallbackUsed {
        account_id: String,
        reason: &'static str,
    },
    MessageSkipped {
        account_id: String,
        message_id: MessageId,
        reason: String,
    },
    CycleCompleted {
        account_id: String,
        stats: CycleStats,
    },
    CycleDeferred {
        account_id: String,
    },
    CycleFailed {
        account_id: String,
        kind: ErrorKind,
        consecutive_errors: u32,
    },
    /// Emitted once when the error counter reaches the threshold
    CooldownEntered {
        account_id: String,
        until: DateTime<Utc>,
    },
}

/// Sink for [`SyncEvent`]s
pub trait Reporter: Send + Sync {
    fn report(&self, event: &SyncEvent);
}

/// Forwards events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: &SyncEvent) {
        match event {
            SyncEvent::PhaseEntered { account_id, phase } => {
                debug!("[{}] entering {:?}", account_id, phase);
            }
            SyncEvent::CycleSkipped { account_id, reason } => {
                debug!("[{}] cycle skipped: {:?}", account_id, reason);
            }
            SyncEvent::LockRecovered {
                account_id,
                previous_holder,
            } => {
                warn!(
                    "[{}] force-released stale lock held by {}",
                    account_id, previous_holder
                );
            }
            SyncEvent::FallbackUsed { account_id, reason } => {
                info!("[{}] using full-window fallback: {}", account_id, reason);
            }
            SyncEvent::MessageSkipped {
                account_id,
                message_id,
                reason,
            } => {
                debug!("[{}] skipped message {}: {}", account_id, message_id, reason);
            }
            SyncEvent::CycleCompleted { account_id, stats } => {
                info!(
                    "[{}] sync complete: {} added, {} classified, {} created, {} updated, {} expired, {} skipped in {}ms",
                    account_id,
                    stats.messages_added,
                    stats.candidates,
                    stats.created,
                    stats.updated,
                    stats.expired,
                    stats.messages_skipped,
                    stats.duration_ms
                );
            }
            SyncEvent::CycleDeferred { account_id } => {
                warn!("[{}] sync deferred: daily quota exhausted", account_id);
            }
            SyncEvent::CycleFailed {
                account_id,
                kind,
                consecutive_errors,
            } => {
                warn!(
                    "[{}] sync failed ({}), {} consecutive errors",
                    account_id,
                    kind.as_str(),
                    consecutive_errors
                );
            }
            SyncEvent::CooldownEntered { account_id, until } => {
                warn!("[{}] too many failures, paused until {}", account_id, until);
            }
        }
    }
}
