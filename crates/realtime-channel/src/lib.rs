//! Vendor-neutral realtime channel adapter for the Courtside client.
//!
//! This crate defines the narrow surface the rest of the client uses to
//! talk to the hosted backend's realtime service:
//! - [`ChannelTransport`]: allocates a channel handle for a named topic
//! - [`ChannelHandle`]: register listeners, subscribe, track presence,
//!   unsubscribe
//! - Change and presence event types shared by every transport
//!
//! The concrete websocket transport lives in `realtime-socket`; tests use
//! scripted in-memory implementations of the same traits. Keeping the
//! vendor's chained-builder SDK style behind these traits means the
//! subscription manager never names a specific backend client.

mod error;
mod handle;
mod types;

pub use error::{ChannelError, ChannelResult};
pub use handle::{ChannelHandle, ChannelTransport, ChangeListener, PresenceListener};
pub use types::{
    ChangeEvent, ChangeFilter, ChannelState, EventKind, PresenceDiff, PresenceState,
};
