use std::time::Duration;

use crate::error::ConnectorError;
use crate::retry::config::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter { delay: Duration, reason: RetryReason },
    Stop { reason: RetryReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NotRetryable,
    AttemptsExhausted,
    RetryAfterHeader,
    Backoff,
}

/// Decide if we should retry and how long to wait.
///
/// - `attempt_no`: 1-based number of the attempt that just failed.
/// - `rand_u64`: RNG for full jitter, only consulted when the policy asks for it.
pub fn decide_retry(
    policy: &RetryPolicy,
    attempt_no: u32,
    err: &ConnectorError,
    rand_u64: impl Fn() -> u64,
) -> RetryDecision {
    if !policy.retries(err) {
        return RetryDecision::Stop {
            reason: RetryReason::NotRetryable,
        };
    }

    if attempt_no >= policy.max_attempts {
        return RetryDecision::Stop {
            reason: RetryReason::AttemptsExhausted,
        };
    }

    // Retry-After wins.
    if let Some(delay) = err.retry_after {
        return RetryDecision::RetryAfter {
            delay: clamp(delay, policy.max_delay),
            reason: RetryReason::RetryAfterHeader,
        };
    }

    // backoff * 2^(attempt_no-1)
    let exp = attempt_no.saturating_sub(1).min(32);
    let raw_ms = (policy.backoff.as_millis() as u64).saturating_mul(1u64 << exp);
    let raw_ms = raw_ms.min(policy.max_delay.as_millis() as u64);

    let delay_ms = if policy.jitter && raw_ms > 0 {
        rand_u64() % (raw_ms + 1)
    } else {
        raw_ms
    };
    RetryDecision::RetryAfter {
        delay: Duration::from_millis(delay_ms),
        reason: RetryReason::Backoff,
    }
}

fn clamp(delay: Duration, max: Duration) -> Duration {
    if delay > max {
        max
    } else {
        delay
    }
}
