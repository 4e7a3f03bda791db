//! Subscription lifecycle: controller, retry scheduling, auth bridge,
//! and liveness monitoring.
//!
//! One [`RealtimeSubscription`] owns at most one live channel handle.
//! Every connect attempt bumps a generation counter and every
//! asynchronous continuation (subscribe completion, listener delivery,
//! retry timer, liveness tick, auth event) re-checks that counter plus a
//! destroyed flag before acting, so superseded handles never deliver and
//! torn-down subscriptions never resurrect themselves.

use crate::callbacks::SubscriptionCallbacks;
use crate::config::{RetryConfig, SubscriptionConfig};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::retry::{backoff_delay, classify, FailureClass};
use auth_events::{AuthEvent, AuthState};
use realtime_channel::{
    ChangeFilter, ChannelError, ChannelHandle, ChannelState, ChannelTransport, PresenceListener,
    PresenceState,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

/// Status broadcast capacity; UI consumers only care about the latest
/// value, lag is acceptable.
const STATUS_CAPACITY: usize = 16;

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// No subscription active.
    Idle,
    /// Subscribe request in flight.
    Connecting,
    /// Live and receiving events.
    Connected,
    /// Connection lost, reconnect in progress.
    Disconnected,
    /// Subscribe failed; retrying, or terminal once the budget is spent.
    Error,
}

/// Shared state owned by one subscription and its background tasks.
struct Core {
    config: SubscriptionConfig,
    retry: RetryConfig,
    transport: Arc<dyn ChannelTransport>,
    auth: Arc<AuthState>,
    callbacks: SubscriptionCallbacks,
    status: RwLock<SubscriptionStatus>,
    status_tx: broadcast::Sender<SubscriptionStatus>,
    /// The live channel handle, at most one at any time.
    handle: Mutex<Option<Box<dyn ChannelHandle>>>,
    /// Last presence snapshot, replaced wholesale on each sync.
    presence: std::sync::Mutex<PresenceState>,
    /// Generic failures since the last successful connect.
    retry_count: AtomicU32,
    /// Bumped on every connect and disconnect; stale continuations
    /// compare against it and bail.
    generation: AtomicU64,
    /// Set once by cleanup; gates every continuation.
    destroyed: AtomicBool,
    /// Sticky within one enabled span: set on first successful
    /// subscribe, cleared by disconnect. The auth bridge only rebuilds
    /// when this is set.
    ever_connected: AtomicBool,
    /// Pending retry timer, at most one outstanding.
    retry_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn is_stale(&self, generation: u64) -> bool {
        self.destroyed.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
    }

    async fn set_status(&self, status: SubscriptionStatus) {
        *self.status.write().await = status;
        let _ = self.status_tx.send(status);
    }

    fn cancel_retry(&self) {
        if let Some(task) = self.retry_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }

    async fn release_handle(&self) {
        if let Some(mut handle) = self.handle.lock().await.take() {
            handle.unsubscribe().await;
        }
    }

    /// Drive one subscribe attempt end-to-end.
    ///
    /// Failures are handed to the retry policy and never returned; only
    /// caller-configuration errors produce an `Err`.
    async fn connect(self: Arc<Self>) -> SubscriptionResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.config.channel_name.is_empty() {
            return Err(SubscriptionError::Config(
                "channel name must not be empty".to_string(),
            ));
        }

        // Supersede any prior attempt before building the new handle.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_retry();
        self.release_handle().await;
        self.set_status(SubscriptionStatus::Connecting).await;

        debug!(
            channel = %self.config.channel_name,
            generation,
            "subscribing to channel"
        );

        let mut handle = match self.transport.channel(&self.config.channel_name) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_status(SubscriptionStatus::Error).await;
                self.clone().handle_failure(generation, err).await;
                return Ok(());
            }
        };

        if let Some(table) = &self.config.table {
            let filter = ChangeFilter {
                schema: self.config.schema.clone(),
                table: table.clone(),
                event: self.config.event_kind,
                filter: self.config.filter.clone(),
            };
            let weak = Arc::downgrade(&self);
            handle.on_changes(
                filter,
                Box::new(move |event| {
                    let Some(core) = weak.upgrade() else { return };
                    if core.is_stale(generation) {
                        return;
                    }
                    if let Some(on_update) = &core.callbacks.on_update {
                        on_update(event);
                    }
                }),
            );
        }

        if self.config.presence {
            handle.on_presence(self.presence_listener(generation));
        }

        match handle.subscribe().await {
            Ok(()) => {
                // Stale check and store are one critical section: a
                // concurrent connect serializes on the handle lock, so a
                // superseded attempt can never slip its handle in after
                // the newer attempt released the slot.
                let mut slot = self.handle.lock().await;
                if self.is_stale(generation) {
                    // A newer attempt won the race while we were waiting.
                    drop(slot);
                    handle.unsubscribe().await;
                    return Ok(());
                }
                if let Some(mut superseded) = slot.replace(handle) {
                    superseded.unsubscribe().await;
                }
                drop(slot);
                self.retry_count.store(0, Ordering::SeqCst);
                self.ever_connected.store(true, Ordering::SeqCst);
                self.set_status(SubscriptionStatus::Connected).await;
                info!(channel = %self.config.channel_name, "channel subscribed");

                if self.config.presence {
                    self.announce_presence().await;
                }
                Ok(())
            }
            Err(err) => {
                handle.unsubscribe().await;
                if self.is_stale(generation) {
                    return Ok(());
                }
                self.set_status(SubscriptionStatus::Error).await;
                self.clone().handle_failure(generation, err).await;
                Ok(())
            }
        }
    }

    fn presence_listener(self: &Arc<Self>, generation: u64) -> PresenceListener {
        let sync_weak = Arc::downgrade(self);
        let join_weak = Arc::downgrade(self);
        let leave_weak = Arc::downgrade(self);
        PresenceListener {
            on_sync: Box::new(move |state| {
                let Some(core) = sync_weak.upgrade() else { return };
                if core.is_stale(generation) {
                    return;
                }
                *core.presence.lock().expect("lock poisoned") = state.clone();
                if let Some(on_sync) = &core.callbacks.on_presence_sync {
                    on_sync(state);
                }
            }),
            on_join: Box::new(move |diff| {
                let Some(core) = join_weak.upgrade() else { return };
                if core.is_stale(generation) {
                    return;
                }
                if let Some(on_join) = &core.callbacks.on_presence_join {
                    on_join(diff);
                }
            }),
            on_leave: Box::new(move |diff| {
                let Some(core) = leave_weak.upgrade() else { return };
                if core.is_stale(generation) {
                    return;
                }
                if let Some(on_leave) = &core.callbacks.on_presence_leave {
                    on_leave(diff);
                }
            }),
        }
    }

    /// Publish this client's own liveness record into the channel.
    async fn announce_presence(&self) {
        let Some(session) = self.auth.session().await else {
            debug!(
                channel = %self.config.channel_name,
                "skipping presence announce (signed out)"
            );
            return;
        };
        let record = serde_json::json!({
            "user_id": session.user_id,
            "online_at": chrono::Utc::now().to_rfc3339(),
        });
        let guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if let Err(err) = handle.track(record).await {
                warn!(
                    channel = %self.config.channel_name,
                    error = %err,
                    "presence track failed"
                );
            }
        }
    }

    /// Decide whether and when to retry after a subscribe failure.
    async fn handle_failure(self: Arc<Self>, generation: u64, err: ChannelError) {
        if self.is_stale(generation) {
            return;
        }

        let delay = match classify(&err) {
            FailureClass::TokenExpired => {
                // Does not count against the budget; a refreshed token
                // arrives out-of-band through the auth bridge.
                debug!(
                    channel = %self.config.channel_name,
                    error = %err,
                    "token expired, retrying on fixed delay"
                );
                self.retry.token_retry_delay
            }
            FailureClass::Generic => {
                let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > self.retry.max_retries {
                    warn!(
                        channel = %self.config.channel_name,
                        attempts = attempt,
                        error = %err,
                        "retry budget exhausted"
                    );
                    if let Some(on_error) = &self.callbacks.on_error {
                        on_error(err);
                    }
                    return;
                }
                let delay = backoff_delay(self.retry.retry_delay, attempt);
                warn!(
                    channel = %self.config.channel_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "channel subscribe failed, scheduling retry"
                );
                delay
            }
        };

        self.schedule_retry(generation, delay);
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64, delay: tokio::time::Duration) {
        let core = self.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if core.is_stale(generation) {
                return;
            }
            let _ = core.clone().connect().await;
        });
        let mut guard = self.retry_task.lock().expect("lock poisoned");
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    /// Tear down the current attempt and return to idle. Idempotent.
    async fn disconnect(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_retry();
        self.release_handle().await;
        self.retry_count.store(0, Ordering::SeqCst);
        self.ever_connected.store(false, Ordering::SeqCst);
        self.presence.lock().expect("lock poisoned").clear();
        self.set_status(SubscriptionStatus::Idle).await;
        debug!(channel = %self.config.channel_name, "subscription disconnected");
    }
}

/// A self-healing subscription to one named realtime channel.
///
/// Create with [`RealtimeSubscription::new`], call [`start`] to go live,
/// and [`cleanup`] when the owner goes away. A cleaned-up subscription
/// cannot be restarted; build a new one instead.
///
/// [`start`]: RealtimeSubscription::start
/// [`cleanup`]: RealtimeSubscription::cleanup
pub struct RealtimeSubscription {
    core: Arc<Core>,
    auth_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    liveness_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeSubscription {
    /// Create a subscription with the default retry configuration.
    pub fn new(
        config: SubscriptionConfig,
        transport: Arc<dyn ChannelTransport>,
        auth: Arc<AuthState>,
        callbacks: SubscriptionCallbacks,
    ) -> Self {
        Self::with_retry(config, RetryConfig::default(), transport, auth, callbacks)
    }

    /// Create a subscription with explicit retry/liveness timing.
    pub fn with_retry(
        config: SubscriptionConfig,
        retry: RetryConfig,
        transport: Arc<dyn ChannelTransport>,
        auth: Arc<AuthState>,
        callbacks: SubscriptionCallbacks,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            core: Arc::new(Core {
                config,
                retry,
                transport,
                auth,
                callbacks,
                status: RwLock::new(SubscriptionStatus::Idle),
                status_tx,
                handle: Mutex::new(None),
                presence: std::sync::Mutex::new(PresenceState::new()),
                retry_count: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                ever_connected: AtomicBool::new(false),
                retry_task: std::sync::Mutex::new(None),
            }),
            auth_task: std::sync::Mutex::new(None),
            liveness_task: std::sync::Mutex::new(None),
        }
    }

    /// The channel name this subscription is bound to.
    pub fn channel_name(&self) -> &str {
        &self.core.config.channel_name
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> SubscriptionStatus {
        *self.core.status.read().await
    }

    /// Subscribe to status changes (for UI connection indicators).
    pub fn status_stream(&self) -> broadcast::Receiver<SubscriptionStatus> {
        self.core.status_tx.subscribe()
    }

    /// Last observed presence snapshot.
    pub fn presence(&self) -> PresenceState {
        self.core.presence.lock().expect("lock poisoned").clone()
    }

    /// Go live: arm the auth bridge and liveness monitor, then connect.
    ///
    /// Fails fast on configuration errors; transport failures are
    /// retried internally and never returned here.
    pub async fn start(&self) -> SubscriptionResult<()> {
        if self.core.destroyed.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Config(
                "subscription has been cleaned up".to_string(),
            ));
        }
        if self.core.config.channel_name.is_empty() {
            return Err(SubscriptionError::Config(
                "channel name must not be empty".to_string(),
            ));
        }

        self.spawn_auth_bridge();
        self.spawn_liveness_monitor();
        self.core.clone().connect().await
    }

    /// Tear down and rebuild the subscription.
    ///
    /// Also the manual retry affordance after a terminal error.
    pub async fn reconnect(&self) -> SubscriptionResult<()> {
        self.core.clone().connect().await
    }

    /// Release the channel and return to idle without destroying the
    /// subscription. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.core.disconnect().await;
    }

    /// Permanently tear down: stop the auth bridge and liveness monitor,
    /// cancel any pending retry, release the channel. Idempotent.
    pub async fn cleanup(&self) {
        self.core.destroyed.store(true, Ordering::SeqCst);
        // Bridge comes down before the controller is considered torn down.
        if let Some(task) = self.auth_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        if let Some(task) = self.liveness_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        self.core.disconnect().await;
    }

    /// React to auth lifecycle events for as long as the subscription
    /// lives: token refresh rebuilds the channel (the transport's
    /// credentials renew out-of-band), sign-out tears it down.
    fn spawn_auth_bridge(&self) {
        let core = self.core.clone();
        let mut events = core.auth.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::TokenRefreshed) => {
                        if core.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        if core.ever_connected.load(Ordering::SeqCst) {
                            info!(
                                channel = %core.config.channel_name,
                                "token refreshed, rebuilding channel"
                            );
                            let _ = core.clone().connect().await;
                        }
                    }
                    Ok(AuthEvent::SignedOut) => {
                        if core.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        info!(
                            channel = %core.config.channel_name,
                            "signed out, tearing down channel"
                        );
                        core.disconnect().await;
                    }
                    Ok(AuthEvent::SignedIn) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth bridge lagged behind auth events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut guard = self.auth_task.lock().expect("lock poisoned");
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    /// Detect silent connection death: poll the handle's reported state
    /// and rebuild when it closed without an error callback.
    fn spawn_liveness_monitor(&self) {
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(core.retry.liveness_interval);
            // The immediate first tick would race the initial connect.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if core.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                let closed = {
                    let guard = core.handle.lock().await;
                    guard
                        .as_ref()
                        .map(|handle| handle.state() == ChannelState::Closed)
                        .unwrap_or(false)
                };
                if closed {
                    warn!(
                        channel = %core.config.channel_name,
                        "channel silently closed, reconnecting"
                    );
                    core.set_status(SubscriptionStatus::Disconnected).await;
                    let _ = core.clone().connect().await;
                }
            }
        });
        let mut guard = self.liveness_task.lock().expect("lock poisoned");
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        // Synchronous best-effort teardown; `cleanup` is the proper path.
        self.core.destroyed.store(true, Ordering::SeqCst);
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        self.core.cancel_retry();
        if let Some(task) = self.auth_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        if let Some(task) = self.liveness_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("channel", &self.core.config.channel_name)
            .finish_non_exhaustive()
    }
}
