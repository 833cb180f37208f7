//! Daily quota ledger and request pacing shared by all account cycles

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult};

/// Provider methods the engine calls, with their fixed quota cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMethod {
    HistoryList,
    MessagesGet,
    MessagesList,
    GetProfile,
}

impl ApiMethod {
    /// Gmail quota units charged per call
    pub fn cost(&self) -> u32 {
        match self {
            ApiMethod::HistoryList => 2,
            ApiMethod::MessagesGet => 5,
            ApiMethod::MessagesList => 5,
            ApiMethod::GetProfile => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApiMethod::HistoryList => "users.history.list",
            ApiMethod::MessagesGet => "users.messages.get",
            ApiMethod::MessagesList => "users.messages.list",
            ApiMethod::GetProfile => "users.getProfile",
        }
    }
}

/// Units consumed per method for one UTC day
#[derive(Debug)]
struct QuotaLedger {
    day: NaiveDate,
    used: BTreeMap<ApiMethod, u64>,
}

impl QuotaLedger {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            used: BTreeMap::new(),
        }
    }

    fn roll(&mut self, today: NaiveDate) {
        if today != self.day {
            self.day = today;
            self.used.clear();
        }
    }

    fn total(&self) -> u64 {
        self.used.values().sum()
    }
}

/// Point-in-time view of the ledger, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub day: NaiveDate,
    pub used: BTreeMap<ApiMethod, u64>,
    pub remaining: u64,
}

/// Tracks quota units against a daily budget and spaces out calls.
///
/// One governor is shared by every concurrently running cycle; each charge is
/// a single critical section so concurrent cycles never overspend.
pub struct QuotaGovernor {
    daily_budget: u64,
    spacing: Duration,
    ledger: Mutex<QuotaLedger>,
    next_slot: Mutex<Instant>,
}

impl QuotaGovernor {
    pub fn new(daily_budget: u64, spacing: Duration) -> Self {
        Self {
            daily_budget,
            spacing,
            ledger: Mutex::new(QuotaLedger::new(Utc::now().date_naive())),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Charge one call of `method`, or refuse if the day's budget can't cover it
    pub fn charge(&self, method: ApiMethod, now: DateTime<Utc>) -> SyncResult<()> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("quota ledger lock poisoned"))?;
        ledger.roll(now.date_naive());

        let cost = u64::from(method.cost());
        let remaining = self.daily_budget.saturating_sub(ledger.total());
        if cost > remaining {
            return Err(SyncError::QuotaExhausted {
                method: method.name(),
                cost: method.cost(),
                remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
            });
        }

        *ledger.used.entry(method).or_insert(0) += cost;
        Ok(())
    }

    /// Units left for the day containing `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> u64 {
        self.snapshot(now).remaining
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> QuotaSnapshot {
        match self.ledger.lock() {
            Ok(mut ledger) => {
                ledger.roll(now.date_naive());
                QuotaSnapshot {
                    day: ledger.day,
                    used: ledger.used.clone(),
                    remaining: self.daily_budget.saturating_sub(ledger.total()),
                }
            }
            Err(_) => QuotaSnapshot {
                day: now.date_naive(),
                used: BTreeMap::new(),
                remaining: 0,
            },
        }
    }

    /// Block until the next call slot.
    ///
    /// Slots are reserved under the lock and slept for outside it, so
    /// concurrent callers queue up `spacing` apart.
    pub fn pace(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let wait = match self.next_slot.lock() {
            Ok(mut next) => {
                let now = Instant::now();
                let slot = (*next).max(now);
                *next = slot + self.spacing;
                slot.saturating_duration_since(now)
            }
            Err(_) => Duration::ZERO,
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}
