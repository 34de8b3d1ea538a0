//! Reconnect policy
//!
//! Pure decision logic for whether a terminated stream should be reopened
//! and how long to wait. The interval is fixed per attempt; the attempt
//! count is used for limiting and reporting, never for backoff growth.

use std::time::Duration;

use super::error::StreamError;

/// Default delay between attempts for the shared operation-event feed
pub const SHARED_RECONNECT_INTERVAL_MS: u64 = 1_000;

/// Default delay between attempts for a per-operation log tail
pub const EPHEMERAL_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Default attempt budget, 0 = unlimited
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Why a stream reached a terminal event
#[derive(Debug, Clone)]
pub enum TerminalCause {
    Error(StreamError),
    /// Clean end of stream; a push feed treats this like a dropped
    /// connection and may reopen
    End,
}

/// Reconnect configuration for one session
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Whether this feed is reconnect-eligible at all
    pub enabled: bool,
    /// Fixed delay between attempts
    pub interval: Duration,
    /// Attempt budget, 0 = unlimited
    pub max_attempts: u32,
}

/// Outcome of a reconnect decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`
    Retry { delay: Duration },
    /// Attempt budget spent; the session becomes terminal and must say so
    Exhausted,
    /// Retrying is not applicable (manual stop, client cancel, empty
    /// subscriber set, or feed not reconnect-eligible)
    No,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, interval: Duration, max_attempts: u32) -> Self {
        Self {
            enabled,
            interval,
            max_attempts,
        }
    }

    /// Policy for a feed that never reconnects on its own
    pub fn disabled() -> Self {
        Self::new(
            false,
            Duration::from_millis(EPHEMERAL_RECONNECT_INTERVAL_MS),
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
        )
    }

    /// Decide whether to reopen after a terminal event.
    ///
    /// Rule order matters: a manual stop always wins, a client-initiated
    /// cancel is a deliberate stop signal rather than a failure, and an
    /// empty subscriber set means nobody is listening.
    pub fn decide(
        &self,
        cause: &TerminalCause,
        manual_stop: bool,
        subscriber_count: usize,
        attempts: u32,
    ) -> RetryDecision {
        if manual_stop {
            return RetryDecision::No;
        }
        if let TerminalCause::Error(err) = cause {
            if err.is_client_cancel() {
                return RetryDecision::No;
            }
            // Precondition failures cannot be fixed by retrying
            if matches!(err, StreamError::NoConfiguration | StreamError::NoClient(_)) {
                return RetryDecision::No;
            }
        }
        if subscriber_count == 0 {
            return RetryDecision::No;
        }
        if !self.enabled {
            return RetryDecision::No;
        }
        if self.max_attempts != 0 && attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay: self.next_delay(attempts),
        }
    }

    /// Delay before the given attempt; fixed, not exponential
    pub fn next_delay(&self, _attempts: u32) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::error::{code, CANCELLED_ON_CLIENT};

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(true, Duration::from_millis(100), max_attempts)
    }

    fn unavailable() -> TerminalCause {
        TerminalCause::Error(StreamError::from_code(code::UNAVAILABLE, "conn refused"))
    }

    #[test]
    fn test_manual_stop_wins() {
        assert_eq!(policy(5).decide(&unavailable(), true, 3, 0), RetryDecision::No);
    }

    #[test]
    fn test_client_cancel_never_retries() {
        let cause =
            TerminalCause::Error(StreamError::from_code(code::CANCELLED, CANCELLED_ON_CLIENT));
        assert_eq!(policy(0).decide(&cause, false, 3, 0), RetryDecision::No);
    }

    #[test]
    fn test_precondition_failures_never_retry() {
        let missing = TerminalCause::Error(StreamError::NoConfiguration);
        assert_eq!(policy(0).decide(&missing, false, 3, 0), RetryDecision::No);
        let no_client = TerminalCause::Error(StreamError::NoClient("tls".to_string()));
        assert_eq!(policy(0).decide(&no_client, false, 3, 0), RetryDecision::No);
    }

    #[test]
    fn test_no_subscribers_no_retry() {
        assert_eq!(policy(5).decide(&unavailable(), false, 0, 0), RetryDecision::No);
    }

    #[test]
    fn test_disabled_feed_never_retries() {
        let policy = ReconnectPolicy::disabled();
        assert_eq!(policy.decide(&unavailable(), false, 1, 0), RetryDecision::No);
        assert_eq!(policy.decide(&TerminalCause::End, false, 1, 0), RetryDecision::No);
    }

    #[test]
    fn test_budget_enforced() {
        let policy = policy(2);
        assert!(matches!(
            policy.decide(&unavailable(), false, 1, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(&unavailable(), false, 1, 1),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            policy.decide(&unavailable(), false, 1, 2),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_zero_budget_means_unlimited() {
        assert!(matches!(
            policy(0).decide(&unavailable(), false, 1, 10_000),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_clean_end_is_retryable() {
        assert!(matches!(
            policy(5).decide(&TerminalCause::End, false, 1, 0),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_delay_is_fixed() {
        let policy = policy(0);
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(40), Duration::from_millis(100));
    }
}
