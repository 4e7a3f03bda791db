//! # Self-healing realtime subscriptions
//!
//! This crate keeps one live change-feed subscription per named channel,
//! recovering automatically from token expiry, transient channel errors,
//! and silently dropped connections.
//!
//! ## Overview
//!
//! A [`RealtimeSubscription`] drives one subscription end-to-end:
//!
//! - builds a channel handle via a [`ChannelTransport`], registers the
//!   change and presence listeners, and subscribes
//! - retries failed subscribes with exponential backoff up to a bounded
//!   budget; token-expiry failures retry on a fixed short delay without
//!   consuming the budget
//! - rebuilds the channel when the auth layer broadcasts a token refresh,
//!   and tears everything down on sign-out
//! - polls the handle's transport state and reconnects when the
//!   connection died without an error callback
//!
//! [`SubscriptionRegistry`] layers the per-channel-name uniqueness rule on
//! top: activating a name that is already live tears the old subscription
//! down first.
//!
//! ## Example
//!
//! ```ignore
//! use realtime_subscription::{RealtimeSubscription, SubscriptionCallbacks, SubscriptionConfig};
//! use realtime_channel::EventKind;
//!
//! let config = SubscriptionConfig::channel("matches_club_1")
//!     .table("matches")
//!     .event_kind(EventKind::Insert)
//!     .filter("club_id=eq.1");
//!
//! let callbacks = SubscriptionCallbacks::new()
//!     .on_update(|change| println!("new match: {:?}", change.record));
//!
//! let subscription = RealtimeSubscription::new(config, transport, auth, callbacks);
//! subscription.start().await?;
//! ```
//!
//! [`ChannelTransport`]: realtime_channel::ChannelTransport

mod callbacks;
mod config;
mod error;
mod manager;
mod registry;
mod retry;

pub use callbacks::SubscriptionCallbacks;
pub use config::{RetryConfig, SubscriptionConfig};
pub use error::{SubscriptionError, SubscriptionResult};
pub use manager::{RealtimeSubscription, SubscriptionStatus};
pub use registry::SubscriptionRegistry;
