//! Change-log fetching: incremental history and the full-window fallback

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeSet;
use std::time::Duration;

use super::classifier::Signature;
use super::session::{ProviderSession, Step};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::models::{HistoryCursor, MessageId};

/// Everything that changed in a mailbox since a cursor
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Highest history position seen while paging
    pub new_cursor: HistoryCursor,
    /// Added messages, plus messages whose labels changed
    pub messages_added: BTreeSet<MessageId>,
    pub messages_removed: BTreeSet<MessageId>,
    /// Label change entries folded into `messages_added`
    pub label_deltas: usize,
    pub pages: usize,
}

impl ChangeSet {
    /// No changes yet; the cursor stays where it was
    pub fn starting_at(cursor: HistoryCursor) -> Self {
        Self {
            new_cursor: cursor,
            messages_added: BTreeSet::new(),
            messages_removed: BTreeSet::new(),
            label_deltas: 0,
            pages: 0,
        }
    }

    /// Ids worth classifying: added and still present at the end of the window
    pub fn to_classify(&self) -> Vec<MessageId> {
        self.messages_added
            .difference(&self.messages_removed)
            .cloned()
            .collect()
    }
}

/// Result of a full-window search
#[derive(Debug, Clone, PartialEq)]
pub struct WindowScan {
    /// Mailbox position captured before searching, so nothing that arrives
    /// during the scan is skipped by the next incremental run
    pub cursor: HistoryCursor,
    pub message_ids: BTreeSet<MessageId>,
    /// True when `max_messages` cut the scan short
    pub truncated: bool,
}

/// Pages through the provider change log
#[derive(Debug, Clone)]
pub struct ChangeLogFetcher {
    page_size: usize,
    page_delay: Duration,
    window_days: u32,
    max_window_messages: usize,
}

impl ChangeLogFetcher {
    pub fn new(
        page_size: usize,
        page_delay: Duration,
        window_days: u32,
        max_window_messages: usize,
    ) -> Self {
        Self {
            page_size: page_size.clamp(1, 500),
            page_delay,
            window_days,
            max_window_messages,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.max_history_page_size,
            config.history_page_delay(),
            config.fallback_window_days,
            config.max_messages_per_fallback,
        )
    }

    /// Collect every change since `cursor`.
    ///
    /// # Errors
    /// `CursorExpired` when the provider no longer knows `cursor`; other
    /// provider errors propagate unchanged.
    pub fn fetch_changes(
        &self,
        session: &ProviderSession<'_>,
        cursor: &HistoryCursor,
    ) -> SyncResult<ChangeSet> {
        let mut changes = ChangeSet::starting_at(cursor.clone());
        let mut page_token: Option<String> = None;

        loop {
            if changes.pages > 0 {
                session.deadline().sleep(self.page_delay, Step::HistoryPage)?;
            }

            let page = session.list_history(cursor, page_token.as_deref(), self.page_size)?;
            changes.pages += 1;

            for record in page.history.unwrap_or_default() {
                changes.new_cursor = changes.new_cursor.max(HistoryCursor::new(record.id));

                for added in record.messages_added.unwrap_or_default() {
                    changes.messages_added.insert(MessageId::new(added.message.id));
                }
                for deleted in record.messages_deleted.unwrap_or_default() {
                    changes
                        .messages_removed
                        .insert(MessageId::new(deleted.message.id));
                }
                let label_changes = record
                    .labels_added
                    .unwrap_or_default()
                    .into_iter()
                    .chain(record.labels_removed.unwrap_or_default());
                for change in label_changes {
                    changes.label_deltas += 1;
                    changes.messages_added.insert(MessageId::new(change.message.id));
                }
            }

            if let Some(history_id) = page.history_id {
                changes.new_cursor = changes.new_cursor.max(HistoryCursor::new(history_id));
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            "History since {}: {} added, {} removed, {} label deltas over {} pages, cursor now {}",
            cursor,
            changes.messages_added.len(),
            changes.messages_removed.len(),
            changes.label_deltas,
            changes.pages,
            changes.new_cursor
        );

        Ok(changes)
    }

    /// Search the recent window for every signature.
    ///
    /// Used when there is no usable cursor. The profile is read first so the
    /// rebuilt cursor never skips messages that arrive mid-scan.
    pub fn fetch_full_window(
        &self,
        session: &ProviderSession<'_>,
        signatures: &[Signature],
        now: DateTime<Utc>,
    ) -> SyncResult<WindowScan> {
        let profile = session.get_profile()?;
        let cursor = HistoryCursor::new(profile.history_id);

        let after = (now - chrono::Duration::days(i64::from(self.window_days))).date_naive();
        let mut message_ids = BTreeSet::new();
        let mut truncated = false;

        'signatures: for signature in signatures {
            let query = format!("{} after:{}", signature.query, after.format("%Y/%m/%d"));
            let mut page_token: Option<String> = None;

            loop {
                let remaining = self.max_window_messages.saturating_sub(message_ids.len());
                if remaining == 0 {
                    truncated = true;
                    break 'signatures;
                }

                let page = session.search_messages(
                    &query,
                    page_token.as_deref(),
                    remaining.min(self.page_size),
                )?;

                for msg in page.messages.unwrap_or_default() {
                    if message_ids.len() >= self.max_window_messages {
                        truncated = true;
                        break 'signatures;
                    }
                    message_ids.insert(MessageId::new(msg.id));
                }

                match page.next_page_token {
                    Some(token) if !token.is_empty() => page_token = Some(token),
                    _ => break,
                }
            }
        }

        debug!(
            "Full-window scan since {}: {} messages{}, cursor {}",
            after,
            message_ids.len(),
            if truncated { " (truncated)" } else { "" },
            cursor
        );

        Ok(WindowScan {
            cursor,
            message_ids,
            truncated,
        })
    }
}
