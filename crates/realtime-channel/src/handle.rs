//! Channel transport traits.
//!
//! The hosted backend's client SDK exposes a chainable builder
//! (`channel(name).on(..).on(..).subscribe()`); these traits flatten that
//! surface to the four operations the subscription manager actually
//! needs: register listeners, subscribe, track presence, unsubscribe.

use crate::error::ChannelResult;
use crate::types::{ChangeEvent, ChangeFilter, ChannelState, PresenceDiff, PresenceState};
use async_trait::async_trait;
use serde_json::Value;

/// Callback invoked for each delivered database change.
pub type ChangeListener = Box<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback bundle for presence deliveries on one channel.
pub struct PresenceListener {
    /// Full-state sync; the receiver replaces its snapshot wholesale.
    pub on_sync: Box<dyn Fn(PresenceState) + Send + Sync>,
    /// Participants joined since the last delivery.
    pub on_join: Box<dyn Fn(PresenceDiff) + Send + Sync>,
    /// Participants left since the last delivery.
    pub on_leave: Box<dyn Fn(PresenceDiff) + Send + Sync>,
}

impl std::fmt::Debug for PresenceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceListener").finish_non_exhaustive()
    }
}

/// Allocates channel handles for named topics.
///
/// One transport serves many channels; each returned handle owns exactly
/// one subscription and is released via [`ChannelHandle::unsubscribe`].
pub trait ChannelTransport: Send + Sync {
    /// Allocate a handle for `topic`. No network activity happens until
    /// [`ChannelHandle::subscribe`] is called.
    fn channel(&self, topic: &str) -> ChannelResult<Box<dyn ChannelHandle>>;
}

/// One subscription to one named channel.
///
/// Listener registration must happen before `subscribe`; registrations
/// after a successful subscribe are not delivered retroactively.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Register a database change listener for the given binding.
    fn on_changes(&mut self, filter: ChangeFilter, listener: ChangeListener);

    /// Register presence listeners.
    fn on_presence(&mut self, listener: PresenceListener);

    /// Issue the subscribe request and wait for the server's verdict.
    async fn subscribe(&mut self) -> ChannelResult<()>;

    /// Leave the channel and release the underlying connection.
    ///
    /// Safe to call when never subscribed or already unsubscribed.
    async fn unsubscribe(&mut self);

    /// Publish this client's presence record into the channel.
    async fn track(&self, record: Value) -> ChannelResult<()>;

    /// Last observed presence snapshot.
    fn presence_state(&self) -> PresenceState;

    /// Reported transport state, polled by the liveness monitor.
    fn state(&self) -> ChannelState;
}
