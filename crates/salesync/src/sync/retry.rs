//! Bounded retry with a configurable backoff schedule

use log::debug;
use std::time::Duration;

use super::session::Step;
use super::timing::Deadline;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// How often and how patiently a failed external call is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    /// Delay before retry N; the last entry repeats
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let delays = (0..config.max_retry_attempts)
            .map(|attempt| config.retry_delay(attempt))
            .collect();
        Self::new(config.max_retry_attempts, delays)
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before retry number `retry` (0-based).
    ///
    /// A provider `Retry-After` hint wins when it asks for longer.
    pub fn delay_for(&self, retry: u32, err: &SyncError) -> Duration {
        let scheduled = self
            .delays
            .get(retry as usize)
            .or(self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO);

        match err {
            SyncError::RateLimited {
                retry_after: Some(hint),
            } => scheduled.max(*hint),
            _ => scheduled,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only retryable errors are retried. The deadline is checked before
    /// every attempt and a backoff that would overrun it fails with `Timeout`.
    pub fn run<T>(
        &self,
        deadline: &Deadline,
        step: Step,
        mut op: impl FnMut() -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut retry = 0;
        loop {
            deadline.check(step)?;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry + 1 < self.max_attempts => {
                    let wait = self.delay_for(retry, &e);
                    debug!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        step.name(),
                        e,
                        retry + 1,
                        self.max_attempts - 1,
                        wait
                    );
                    deadline.sleep(wait, step)?;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn transient() -> SyncError {
        SyncError::TransientProvider {
            message: "503".into(),
        }
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, vec![Duration::from_millis(1)]);
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;

        let result = policy.run(&deadline, Step::MessageFetch, || {
            calls += 1;
            if calls < 3 { Err(transient()) } else { Ok(calls) }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, vec![Duration::ZERO]);
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;

        let err = policy
            .run(&deadline, Step::MessageFetch, || -> SyncResult<()> {
                calls += 1;
                Err(transient())
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientProvider);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, vec![Duration::ZERO]);
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut calls = 0;

        let err = policy
            .run(&deadline, Step::HistoryPage, || -> SyncResult<()> {
                calls += 1;
                Err(SyncError::CursorExpired {
                    cursor: "100".into(),
                })
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CursorExpired);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_past_deadline_times_out() {
        let policy = RetryPolicy::new(3, vec![Duration::from_secs(60)]);
        let deadline = Deadline::after(Duration::from_millis(100));

        let err = policy
            .run(&deadline, Step::MessageFetch, || -> SyncResult<()> {
                Err(transient())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_delay_schedule_and_retry_after() {
        let policy = RetryPolicy::new(
            4,
            vec![Duration::from_millis(10), Duration::from_millis(20)],
        );
        assert_eq!(policy.delay_for(0, &transient()), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3, &transient()), Duration::from_millis(20));

        let throttled = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_for(0, &throttled), Duration::from_secs(2));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&SyncConfig::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1, &transient()), Duration::from_millis(2_000));
    }
}
