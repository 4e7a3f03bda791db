//! Per-channel-name subscription registry.
//!
//! Exactly one live subscription may exist per activated channel name;
//! activating a name that is already live tears the previous
//! subscription down before the new one connects.

use crate::callbacks::SubscriptionCallbacks;
use crate::config::{RetryConfig, SubscriptionConfig};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::manager::RealtimeSubscription;
use auth_events::AuthState;
use realtime_channel::ChannelTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Owns every active subscription, keyed by channel name.
pub struct SubscriptionRegistry {
    transport: Arc<dyn ChannelTransport>,
    auth: Arc<AuthState>,
    retry: RetryConfig,
    active: Mutex<HashMap<String, Arc<RealtimeSubscription>>>,
}

impl SubscriptionRegistry {
    /// Create a registry with the default retry configuration.
    pub fn new(transport: Arc<dyn ChannelTransport>, auth: Arc<AuthState>) -> Self {
        Self::with_retry(transport, auth, RetryConfig::default())
    }

    /// Create a registry with explicit retry/liveness timing applied to
    /// every subscription it activates.
    pub fn with_retry(
        transport: Arc<dyn ChannelTransport>,
        auth: Arc<AuthState>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            auth,
            retry,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Activate a subscription. Tears down any live subscription under
    /// the same channel name first; the old handle is fully released
    /// before the new one connects.
    pub async fn activate(
        &self,
        config: SubscriptionConfig,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionResult<Arc<RealtimeSubscription>> {
        if config.channel_name.is_empty() {
            return Err(SubscriptionError::Config(
                "channel name must not be empty".to_string(),
            ));
        }

        // Teardown and connect run outside the lock so a slow subscribe
        // cannot stall unrelated registry operations.
        let name = config.channel_name.clone();
        let previous = self.active.lock().await.remove(&name);
        if let Some(previous) = previous {
            debug!(channel = %name, "replacing live subscription");
            previous.cleanup().await;
        }

        let subscription = Arc::new(RealtimeSubscription::with_retry(
            config,
            self.retry.clone(),
            self.transport.clone(),
            self.auth.clone(),
            callbacks,
        ));
        subscription.start().await?;

        // A concurrent activation of the same name may have slipped in
        // while we were connecting; the displaced one is torn down, never
        // silently dropped.
        let displaced = self
            .active
            .lock()
            .await
            .insert(name.clone(), subscription.clone());
        if let Some(displaced) = displaced {
            displaced.cleanup().await;
        }
        info!(channel = %name, "subscription activated");
        Ok(subscription)
    }

    /// Tear down the subscription under `channel_name`, if any.
    ///
    /// Returns whether one was live.
    pub async fn deactivate(&self, channel_name: &str) -> bool {
        let removed = self.active.lock().await.remove(channel_name);
        match removed {
            Some(subscription) => {
                subscription.cleanup().await;
                info!(channel = %channel_name, "subscription deactivated");
                true
            }
            None => false,
        }
    }

    /// Whether a subscription is live under `channel_name`.
    pub async fn is_active(&self, channel_name: &str) -> bool {
        self.active.lock().await.contains_key(channel_name)
    }

    /// Names of every live subscription.
    pub async fn active_channels(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Tear down every live subscription.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.active.lock().await.drain().collect();
        for (name, subscription) in drained {
            subscription.cleanup().await;
            debug!(channel = %name, "subscription torn down");
        }
        info!("subscription registry shut down");
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry").finish_non_exhaustive()
    }
}
