//! Channel error taxonomy.
//!
//! The subscription manager's retry policy keys off one distinction:
//! token-expiry errors (always retried, the auth layer is expected to
//! deliver a fresh token imminently) versus everything else (retried
//! within a bounded budget). [`ChannelError::is_token_expired`] is the
//! single classification point.

use thiserror::Error;

/// Errors produced by a channel transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The server rejected the subscribe request.
    #[error("channel error: {0}")]
    Channel(String),

    /// The subscribe request did not complete within the deadline.
    #[error("subscribe timed out")]
    TimedOut,

    /// The underlying connection closed before or during the operation.
    #[error("channel closed")]
    Closed,

    /// The realtime access token was rejected as expired or invalid.
    #[error("realtime token expired: {0}")]
    TokenExpired(String),

    /// Transport-level failure (socket, TLS, framing).
    #[error("transport error: {0}")]
    Transport(String),

    /// A wire frame could not be serialized or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller supplied an invalid configuration.
    ///
    /// Never retried; reported synchronously before any subscribe is issued.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChannelError {
    /// Whether this error indicates an expired or invalid auth token.
    ///
    /// Servers do not always use the dedicated error shape, so channel and
    /// transport messages are also sniffed for the usual token phrasings.
    pub fn is_token_expired(&self) -> bool {
        match self {
            ChannelError::TokenExpired(_) => true,
            ChannelError::Channel(msg) | ChannelError::Transport(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("jwt expired")
                    || (msg.contains("token")
                        && (msg.contains("expired") || msg.contains("invalid")))
            }
            _ => false,
        }
    }
}

/// Result type alias using ChannelError.
pub type ChannelResult<T> = Result<T, ChannelError>;
