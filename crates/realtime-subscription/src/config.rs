//! Subscription and retry configuration.

use realtime_channel::EventKind;
use tokio::time::Duration;

/// Configuration for one logical subscription.
///
/// Immutable for the lifetime of a subscription attempt. A config with
/// no `table` and presence disabled is a caller mistake but must not
/// crash: it produces a connected-but-silent subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Logical channel identifier; unique per independent subscription.
    pub channel_name: String,
    /// Backing change-feed table; `None` means presence-only.
    pub table: Option<String>,
    /// Server-side row filter expression (e.g. `club_id=eq.1`).
    pub filter: Option<String>,
    /// Which change types to receive.
    pub event_kind: EventKind,
    /// Database schema the table lives in.
    pub schema: String,
    /// Whether presence tracking is enabled on this channel.
    pub presence: bool,
}

impl SubscriptionConfig {
    /// Create a config for `channel_name` with defaults: no table, no
    /// filter, all event kinds, `public` schema, presence disabled.
    pub fn channel(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            table: None,
            filter: None,
            event_kind: EventKind::All,
            schema: "public".to_string(),
            presence: false,
        }
    }

    /// Set the backing change-feed table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Set the server-side row filter.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set which change types to receive.
    pub fn event_kind(mut self, kind: EventKind) -> Self {
        self.event_kind = kind;
        self
    }

    /// Set the database schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Enable presence tracking.
    pub fn with_presence(mut self) -> Self {
        self.presence = true;
        self
    }
}

/// Retry, backoff, and liveness timing.
///
/// Generic failures retry `retry_delay * 2^(attempt-1)` up to
/// `max_retries` attempts; token-expiry failures always retry after
/// `token_retry_delay` and never consume the budget.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts for generic failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay: Duration,
    /// Fixed delay before retrying a token-expiry failure.
    pub token_retry_delay: Duration,
    /// How often the liveness monitor polls the channel state.
    pub liveness_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            token_retry_delay: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(30),
        }
    }
}
