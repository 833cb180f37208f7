//! Metered access to the mail provider for one account cycle
//!
//! Every provider call goes through a [`ProviderSession`], which makes each
//! call a named suspension point: the deadline is checked, the quota charged,
//! the request paced and retried on transient failure.

use std::sync::atomic::{AtomicU32, Ordering};

use super::retry::RetryPolicy;
use super::timing::Deadline;
use crate::clock::Clock;
use crate::error::SyncResult;
use crate::gmail::MailProvider;
use crate::gmail::api::{GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse};
use crate::models::{HistoryCursor, MessageId};
use crate::quota::{ApiMethod, QuotaGovernor};

/// External calls a cycle can suspend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    TokenRefresh,
    HistoryPage,
    MessageFetch,
    MessageSearch,
    Profile,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::TokenRefresh => "token refresh",
            Step::HistoryPage => "history page",
            Step::MessageFetch => "message fetch",
            Step::MessageSearch => "message search",
            Step::Profile => "profile",
        }
    }

    /// Quota-metered provider method, if the step calls one
    pub fn api_method(&self) -> Option<ApiMethod> {
        match self {
            Step::TokenRefresh => None,
            Step::HistoryPage => Some(ApiMethod::HistoryList),
            Step::MessageFetch => Some(ApiMethod::MessagesGet),
            Step::MessageSearch => Some(ApiMethod::MessagesList),
            Step::Profile => Some(ApiMethod::GetProfile),
        }
    }
}

/// Provider handle bound to one account's access token and cycle budget
pub struct ProviderSession<'a> {
    provider: &'a dyn MailProvider,
    quota: &'a QuotaGovernor,
    clock: &'a dyn Clock,
    retry: &'a RetryPolicy,
    deadline: Deadline,
    access_token: String,
    calls: AtomicU32,
}

impl<'a> ProviderSession<'a> {
    pub fn new(
        provider: &'a dyn MailProvider,
        quota: &'a QuotaGovernor,
        clock: &'a dyn Clock,
        retry: &'a RetryPolicy,
        deadline: Deadline,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            quota,
            clock,
            retry,
            deadline,
            access_token: access_token.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Provider requests issued so far, retries included
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn call<T>(
        &self,
        step: Step,
        op: impl Fn(&dyn MailProvider, &str) -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.retry.run(&self.deadline, step, || {
            // Every attempt is a real request, so every attempt is charged
            if let Some(method) = step.api_method() {
                self.quota.charge(method, self.clock.now())?;
            }
            self.quota.pace();
            self.calls.fetch_add(1, Ordering::Relaxed);
            op(self.provider, &self.access_token)
        })
    }

    pub fn list_history(
        &self,
        start: &HistoryCursor,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<HistoryResponse> {
        self.call(Step::HistoryPage, |provider, token| {
            provider.list_history(token, start, page_token, max_results)
        })
    }

    pub fn get_message(&self, id: &MessageId) -> SyncResult<GmailMessage> {
        self.call(Step::MessageFetch, |provider, token| {
            provider.get_message(token, id)
        })
    }

    pub fn search_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> SyncResult<ListMessagesResponse> {
        self.call(Step::MessageSearch, |provider, token| {
            provider.search_messages(token, query, page_token, max_results)
        })
    }

    pub fn get_profile(&self) -> SyncResult<ProfileResponse> {
        self.call(Step::Profile, |provider, token| provider.get_profile(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ErrorKind, SyncError};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails `get_profile` a fixed number of times, then succeeds
    struct FlakyProvider {
        failures_left: Mutex<u32>,
    }

    impl MailProvider for FlakyProvider {
        fn list_history(
            &self,
            _token: &str,
            start: &HistoryCursor,
            _page_token: Option<&str>,
            _max_results: usize,
        ) -> SyncResult<HistoryResponse> {
            Err(SyncError::CursorExpired {
                cursor: start.to_string(),
            })
        }

        fn get_message(&self, _token: &str, id: &MessageId) -> SyncResult<GmailMessage> {
            Err(SyncError::Provider {
                message: format!("{} gone", id),
            })
        }

        fn search_messages(
            &self,
            _token: &str,
            _query: &str,
            _page_token: Option<&str>,
            _max_results: usize,
        ) -> SyncResult<ListMessagesResponse> {
            Ok(ListMessagesResponse::default())
        }

        fn get_profile(&self, token: &str) -> SyncResult<ProfileResponse> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(SyncError::TransientProvider {
                    message: "502".into(),
                });
            }
            Ok(ProfileResponse {
                email_address: format!("{}@example.com", token),
                messages_total: None,
                history_id: "500".into(),
            })
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_each_attempt_is_charged() {
        let provider = FlakyProvider {
            failures_left: Mutex::new(1),
        };
        let quota = QuotaGovernor::new(100, Duration::ZERO);
        let clock = clock();
        let retry = RetryPolicy::new(3, vec![Duration::ZERO]);
        let session = ProviderSession::new(
            &provider,
            &quota,
            &clock,
            &retry,
            Deadline::after(Duration::from_secs(5)),
            "seller",
        );

        let profile = session.get_profile().unwrap();
        assert_eq!(profile.email_address, "seller@example.com");
        assert_eq!(session.calls(), 2);
        assert_eq!(quota.remaining(clock.now()), 98);
    }

    #[test]
    fn test_quota_exhaustion_stops_before_calling() {
        let provider = FlakyProvider {
            failures_left: Mutex::new(0),
        };
        let quota = QuotaGovernor::new(4, Duration::ZERO);
        let clock = clock();
        let retry = RetryPolicy::no_retry();
        let session = ProviderSession::new(
            &provider,
            &quota,
            &clock,
            &retry,
            Deadline::after(Duration::from_secs(5)),
            "t",
        );

        let err = session.get_message(&MessageId::new("m1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExhausted);
        assert_eq!(session.calls(), 0);
    }

    #[test]
    fn test_expired_deadline_stops_before_calling() {
        let provider = FlakyProvider {
            failures_left: Mutex::new(0),
        };
        let quota = QuotaGovernor::new(100, Duration::ZERO);
        let clock = clock();
        let retry = RetryPolicy::no_retry();
        let session = ProviderSession::new(
            &provider,
            &quota,
            &clock,
            &retry,
            Deadline::after(Duration::ZERO),
            "t",
        );

        let err = session.get_profile().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(session.calls(), 0);
        assert_eq!(quota.remaining(clock.now()), 100);
    }
}
