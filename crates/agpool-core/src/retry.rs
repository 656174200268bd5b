//! Shared retry decision table for the two strategies.
//!
//! The gateway runs the loops (they differ in shape between chat and the
//! light count-tokens calls); this module owns the classification of what a
//! failed attempt means for the loop.

use std::time::Duration;

use crate::error::UpstreamError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra same-account tries for chat (server-capacity errors only).
    pub same_account_retries: u32,
    pub same_account_retry_delay: Duration,
    /// Base delay between capacity-retry attempts (count tokens).
    pub capacity_retry_delay: Duration,
    /// Wall-clock bound for the whole full-retry run.
    pub total_timeout: Duration,
    /// Capacity-strategy attempt bound is this + 2.
    pub max_capacity_retries: u32,
}

/// What the loop should do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Try again on the same account after the delay (server-capacity
    /// exhausted: the upstream itself is saturated).
    RetrySameAccount { delay: Duration },
    /// One forced token refresh, then one more try on the same account.
    RefreshAndRetry,
    /// Give up on this account, cool it down if applicable, move on.
    SwitchAccount { cooldown: bool },
    /// Not retryable at all; surface to the client.
    Fail,
}

pub fn decide(error: &UpstreamError, policy: &RetryPolicy, refresh_spent: bool) -> NextStep {
    match error {
        UpstreamError::Capacity {
            server_exhausted: true,
            retry_after_ms,
            ..
        } => NextStep::RetrySameAccount {
            delay: retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or(policy.same_account_retry_delay),
        },
        UpstreamError::Capacity { .. } => NextStep::SwitchAccount { cooldown: true },
        UpstreamError::Auth {
            refresh_invalid: true,
            ..
        } => NextStep::SwitchAccount { cooldown: false },
        UpstreamError::Auth { .. } => {
            if refresh_spent {
                NextStep::SwitchAccount { cooldown: false }
            } else {
                NextStep::RefreshAndRetry
            }
        }
        UpstreamError::Network { .. } | UpstreamError::Timeout => {
            NextStep::SwitchAccount { cooldown: false }
        }
        UpstreamError::Cancelled
        | UpstreamError::NonRetryable { .. }
        | UpstreamError::BadRequest { .. }
        | UpstreamError::NoCapacity { .. }
        | UpstreamError::Storage { .. } => NextStep::Fail,
    }
}

/// Delay before the next capacity-strategy attempt: the upstream's own
/// reset hint when present, otherwise linear backoff.
pub fn capacity_delay(error: &UpstreamError, policy: &RetryPolicy, attempt: u32) -> Duration {
    error
        .retry_after_ms()
        .map(Duration::from_millis)
        .unwrap_or_else(|| policy.capacity_retry_delay * attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            same_account_retries: 1,
            same_account_retry_delay: Duration::from_millis(100),
            capacity_retry_delay: Duration::from_millis(200),
            total_timeout: Duration::from_secs(30),
            max_capacity_retries: 2,
        }
    }

    fn capacity(server: bool, retry_after_ms: Option<u64>) -> UpstreamError {
        UpstreamError::Capacity {
            message: "cap".into(),
            server_exhausted: server,
            retry_after_ms,
        }
    }

    #[test]
    fn server_capacity_stays_on_the_account() {
        assert_eq!(
            decide(&capacity(true, Some(500)), &policy(), false),
            NextStep::RetrySameAccount {
                delay: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn account_capacity_switches_with_cooldown() {
        assert_eq!(
            decide(&capacity(false, None), &policy(), false),
            NextStep::SwitchAccount { cooldown: true }
        );
    }

    #[test]
    fn auth_gets_exactly_one_refresh() {
        let err = UpstreamError::Auth {
            message: "401".into(),
            refresh_invalid: false,
        };
        assert_eq!(decide(&err, &policy(), false), NextStep::RefreshAndRetry);
        assert_eq!(
            decide(&err, &policy(), true),
            NextStep::SwitchAccount { cooldown: false }
        );
    }

    #[test]
    fn invalid_refresh_token_switches_immediately() {
        let err = UpstreamError::Auth {
            message: "invalid_grant".into(),
            refresh_invalid: true,
        };
        assert_eq!(
            decide(&err, &policy(), false),
            NextStep::SwitchAccount { cooldown: false }
        );
    }

    #[test]
    fn non_retryable_and_cancel_fail_fast() {
        assert_eq!(
            decide(
                &UpstreamError::NonRetryable {
                    message: "bad".into(),
                    status: 400
                },
                &policy(),
                false
            ),
            NextStep::Fail
        );
        assert_eq!(decide(&UpstreamError::Cancelled, &policy(), false), NextStep::Fail);
    }

    #[test]
    fn capacity_delay_prefers_reset_hint() {
        assert_eq!(
            capacity_delay(&capacity(false, Some(8_000)), &policy(), 3),
            Duration::from_millis(8_000)
        );
        assert_eq!(
            capacity_delay(&capacity(false, None), &policy(), 3),
            Duration::from_millis(600)
        );
    }
}
