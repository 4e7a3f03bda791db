//! Authentication event bus for the Courtside client.
//!
//! The auth layer is a process-wide singleton with many independent
//! consumers: every active realtime subscription registers its own
//! listener and reacts to token refreshes and sign-outs on its own.
//! This crate models that stream explicitly as a broadcast channel plus
//! a shared snapshot of the signed-in session (user id + access token),
//! which presence tracking uses to announce the local participant.
//!
//! Consumers hold a [`tokio::sync::broadcast::Receiver`] and deregister
//! simply by dropping it; the bus itself carries no per-consumer state.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Broadcast capacity. Auth transitions are rare; a small buffer only
/// needs to absorb bursts while a consumer task is being scheduled.
const EVENT_CAPACITY: usize = 32;

/// Authentication lifecycle events observed by realtime subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// A user signed in; a session snapshot is now available.
    SignedIn,
    /// The access token was renewed. Transports holding the old token
    /// must rebuild their connections.
    TokenRefreshed,
    /// The user signed out; all realtime activity must stop.
    SignedOut,
}

/// Snapshot of the signed-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Stable user identifier, used as the presence participant key.
    pub user_id: String,
    /// Current access token for the realtime connection.
    pub access_token: String,
}

/// Process-wide auth state: current session plus the event stream.
///
/// Cheap to clone via [`Arc`]; typically created once at startup and
/// handed to every subsystem that needs auth awareness.
pub struct AuthState {
    session: RwLock<Option<SessionInfo>>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthState {
    /// Create a signed-out auth state.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            session: RwLock::new(None),
            events,
        })
    }

    /// Register a listener for auth events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Current session snapshot, if signed in.
    pub async fn session(&self) -> Option<SessionInfo> {
        self.session.read().await.clone()
    }

    /// Whether a user is currently signed in.
    pub async fn is_signed_in(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Record a sign-in and notify listeners.
    pub async fn signed_in(&self, info: SessionInfo) {
        *self.session.write().await = Some(info);
        info!("auth session established");
        let _ = self.events.send(AuthEvent::SignedIn);
    }

    /// Record a token refresh and notify listeners.
    ///
    /// No-op when signed out; a refresh without a session is a stale
    /// callback from the auth provider.
    pub async fn token_refreshed(&self, access_token: impl Into<String>) {
        let mut guard = self.session.write().await;
        let Some(session) = guard.as_mut() else {
            debug!("ignoring token refresh while signed out");
            return;
        };
        session.access_token = access_token.into();
        drop(guard);
        debug!("auth token refreshed");
        let _ = self.events.send(AuthEvent::TokenRefreshed);
    }

    /// Clear the session and notify listeners.
    pub async fn signed_out(&self) {
        *self.session.write().await = None;
        info!("auth session cleared");
        let _ = self.events.send(AuthEvent::SignedOut);
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> SessionInfo {
        SessionInfo {
            user_id: "user-1".to_string(),
            access_token: "token-1".to_string(),
        }
    }

    #[tokio::test]
    async fn starts_signed_out() {
        let auth = AuthState::new();
        assert!(!auth.is_signed_in().await);
        assert!(auth.session().await.is_none());
    }

    #[tokio::test]
    async fn sign_in_broadcasts_and_stores_session() {
        let auth = AuthState::new();
        let mut rx = auth.subscribe();

        auth.signed_in(test_session()).await;

        assert_eq!(rx.recv().await.unwrap(), AuthEvent::SignedIn);
        assert_eq!(auth.session().await.unwrap().user_id, "user-1");
    }

    #[tokio::test]
    async fn token_refresh_updates_token_and_broadcasts() {
        let auth = AuthState::new();
        auth.signed_in(test_session()).await;
        let mut rx = auth.subscribe();

        auth.token_refreshed("token-2").await;

        assert_eq!(rx.recv().await.unwrap(), AuthEvent::TokenRefreshed);
        assert_eq!(auth.session().await.unwrap().access_token, "token-2");
    }

    #[tokio::test]
    async fn token_refresh_while_signed_out_is_ignored() {
        let auth = AuthState::new();
        let mut rx = auth.subscribe();

        auth.token_refreshed("token-2").await;

        assert!(rx.try_recv().is_err());
        assert!(!auth.is_signed_in().await);
    }

    #[tokio::test]
    async fn sign_out_clears_session_and_broadcasts() {
        let auth = AuthState::new();
        auth.signed_in(test_session()).await;
        let mut rx = auth.subscribe();

        auth.signed_out().await;

        assert_eq!(rx.recv().await.unwrap(), AuthEvent::SignedOut);
        assert!(!auth.is_signed_in().await);
    }

    #[tokio::test]
    async fn independent_receivers_each_see_events() {
        let auth = AuthState::new();
        let mut a = auth.subscribe();
        let mut b = auth.subscribe();

        auth.signed_in(test_session()).await;

        assert_eq!(a.recv().await.unwrap(), AuthEvent::SignedIn);
        assert_eq!(b.recv().await.unwrap(), AuthEvent::SignedIn);
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_publish() {
        let auth = AuthState::new();
        let rx = auth.subscribe();
        drop(rx);

        // Publishing with no live receivers must not error out.
        auth.signed_in(test_session()).await;
        auth.signed_out().await;
    }
}
