//! Opaque change-log position

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A point in the provider's change history (Gmail historyId).
///
/// Gmail history IDs are decimal integers serialized as strings. Ordering
/// compares numerically when both sides parse, lexically otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryCursor(pub String);

impl HistoryCursor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The later of two cursors
    pub fn max(self, other: HistoryCursor) -> HistoryCursor {
        if other > self { other } else { self }
    }
}

impl PartialOrd for HistoryCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HistoryCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl std::fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
