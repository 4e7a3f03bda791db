//! Subscription error types.

use realtime_channel::ChannelError;
use thiserror::Error;

/// Errors surfaced to callers of the subscription API.
///
/// Recoverable channel failures are handled internally by the retry
/// policy and never appear here; the only channel errors a caller sees
/// arrive through the `on_error` callback after the retry budget is
/// exhausted.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The caller supplied an invalid configuration.
    ///
    /// Reported synchronously; no subscribe request is issued.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A channel operation failed outside the retry path.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Result type alias using SubscriptionError.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;
