//! Websocket channel transport for the Courtside realtime backend.
//!
//! Implements [`realtime_channel::ChannelTransport`] over the hosted
//! backend's Phoenix-style realtime protocol: channels join under
//! `realtime:<name>` topics, database changes arrive as
//! `postgres_changes` frames, presence as `presence_state` and
//! `presence_diff` frames, with socket-level heartbeats on the reserved
//! `phoenix` topic.

mod channel;
mod config;
mod messages;

pub use channel::RealtimeSocket;
pub use config::SocketConfig;
