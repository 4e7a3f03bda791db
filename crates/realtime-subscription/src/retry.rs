//! Retry classification and backoff computation.

use realtime_channel::ChannelError;
use tokio::time::Duration;

/// How a subscribe failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    /// Auth token expired: retry on a fixed delay, never exhaust the
    /// budget. A refreshed token is expected imminently from the auth
    /// bridge independently.
    TokenExpired,
    /// Everything else: exponential backoff within the retry budget.
    Generic,
}

/// Classify a channel failure for the retry policy.
pub(crate) fn classify(err: &ChannelError) -> FailureClass {
    if err.is_token_expired() {
        FailureClass::TokenExpired
    } else {
        FailureClass::Generic
    }
}

/// Exponential backoff delay for the given attempt: `base * 2^(attempt-1)`.
///
/// Attempt numbers start at 1; attempt 0 yields zero delay. Saturates
/// instead of overflowing for absurd attempt counts.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier)
}
