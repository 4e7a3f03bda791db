//! Caller-supplied callback bundle.

use realtime_channel::{ChangeEvent, ChannelError, PresenceDiff, PresenceState};

/// Callbacks delivered by a subscription. All optional; unset callbacks
/// drop their deliveries silently.
///
/// Callbacks run on the subscription's async tasks and must not block.
#[derive(Default)]
pub struct SubscriptionCallbacks {
    pub(crate) on_update: Option<Box<dyn Fn(ChangeEvent) + Send + Sync>>,
    pub(crate) on_presence_sync: Option<Box<dyn Fn(PresenceState) + Send + Sync>>,
    pub(crate) on_presence_join: Option<Box<dyn Fn(PresenceDiff) + Send + Sync>>,
    pub(crate) on_presence_leave: Option<Box<dyn Fn(PresenceDiff) + Send + Sync>>,
    pub(crate) on_error: Option<Box<dyn Fn(ChannelError) + Send + Sync>>,
}

impl SubscriptionCallbacks {
    /// Create an empty callback bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for each delivered database change.
    pub fn on_update(mut self, f: impl Fn(ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    /// Called with the full presence snapshot after each sync.
    pub fn on_presence_sync(mut self, f: impl Fn(PresenceState) + Send + Sync + 'static) -> Self {
        self.on_presence_sync = Some(Box::new(f));
        self
    }

    /// Called when participants join the channel.
    pub fn on_presence_join(mut self, f: impl Fn(PresenceDiff) + Send + Sync + 'static) -> Self {
        self.on_presence_join = Some(Box::new(f));
        self
    }

    /// Called when participants leave the channel.
    pub fn on_presence_leave(mut self, f: impl Fn(PresenceDiff) + Send + Sync + 'static) -> Self {
        self.on_presence_leave = Some(Box::new(f));
        self
    }

    /// Called once when the retry budget is exhausted. The subscription
    /// stays in the error state until the caller reconnects.
    pub fn on_error(mut self, f: impl Fn(ChannelError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallbacks")
            .field("on_update", &self.on_update.is_some())
            .field("on_presence_sync", &self.on_presence_sync.is_some())
            .field("on_presence_join", &self.on_presence_join.is_some())
            .field("on_presence_leave", &self.on_presence_leave.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
