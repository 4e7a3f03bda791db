//! Scripted in-memory channel transport for subscription tests.
//!
//! Subscribe outcomes are scripted per attempt; an exhausted script
//! means every further attempt succeeds. Injected events are delivered
//! to every listener ever registered, including listeners of superseded
//! handles, so tests can prove the manager discards stale deliveries.

use async_trait::async_trait;
use realtime_channel::{
    ChangeEvent, ChangeFilter, ChangeListener, ChannelError, ChannelHandle, ChannelResult,
    ChannelState, ChannelTransport, PresenceDiff, PresenceListener, PresenceState,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted result of one subscribe attempt.
pub enum SubscribeOutcome {
    Ok,
    ChannelError(&'static str),
    TokenExpired,
}

/// Listeners captured from a handle whose subscribe succeeded.
struct RegisteredChannel {
    #[allow(dead_code)]
    topic: String,
    change_filter: Option<ChangeFilter>,
    change: Option<ChangeListener>,
    presence: Option<PresenceListener>,
    state: Arc<Mutex<ChannelState>>,
}

struct TransportInner {
    outcomes: Mutex<VecDeque<SubscribeOutcome>>,
    subscribe_attempts: AtomicUsize,
    live_handles: AtomicUsize,
    registered: Mutex<Vec<RegisteredChannel>>,
    tracked: Mutex<Vec<Value>>,
}

/// A [`ChannelTransport`] driven entirely by the test.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Arc<TransportInner>,
}

/// Install the test log subscriber once; `RUST_LOG=debug cargo test`
/// then surfaces the manager's tracing output per test.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl ScriptedTransport {
    pub fn new() -> Self {
        init_tracing();
        Self {
            inner: Arc::new(TransportInner {
                outcomes: Mutex::new(VecDeque::new()),
                subscribe_attempts: AtomicUsize::new(0),
                live_handles: AtomicUsize::new(0),
                registered: Mutex::new(Vec::new()),
                tracked: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue outcomes for the next subscribe attempts, in order.
    pub fn script(&self, outcomes: Vec<SubscribeOutcome>) {
        self.inner.outcomes.lock().unwrap().extend(outcomes);
    }

    /// Total subscribe attempts across all handles.
    pub fn attempts(&self) -> usize {
        self.inner.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// Handles currently subscribed and not yet unsubscribed.
    pub fn live_handles(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    /// Presence records published via `track`.
    pub fn tracked(&self) -> Vec<Value> {
        self.inner.tracked.lock().unwrap().clone()
    }

    /// Flip the reported state of the most recently subscribed handle.
    pub fn set_live_state(&self, state: ChannelState) {
        if let Some(channel) = self.inner.registered.lock().unwrap().last() {
            *channel.state.lock().unwrap() = state;
        }
    }

    /// Deliver a change to every registered listener whose binding
    /// matches, stale listeners included.
    pub fn inject_change(&self, event: ChangeEvent) {
        let registered = self.inner.registered.lock().unwrap();
        for channel in registered.iter() {
            let Some(filter) = &channel.change_filter else {
                continue;
            };
            if filter.schema != event.schema || filter.table != event.table {
                continue;
            }
            if !filter.event.matches(event.kind) {
                continue;
            }
            if !row_matches(&filter.filter, &event.record) {
                continue;
            }
            if let Some(listener) = &channel.change {
                listener(event.clone());
            }
        }
    }

    pub fn inject_presence_sync(&self, state: PresenceState) {
        for channel in self.inner.registered.lock().unwrap().iter() {
            if let Some(listener) = &channel.presence {
                (listener.on_sync)(state.clone());
            }
        }
    }

    pub fn inject_presence_join(&self, diff: PresenceDiff) {
        for channel in self.inner.registered.lock().unwrap().iter() {
            if let Some(listener) = &channel.presence {
                (listener.on_join)(diff.clone());
            }
        }
    }

    pub fn inject_presence_leave(&self, diff: PresenceDiff) {
        for channel in self.inner.registered.lock().unwrap().iter() {
            if let Some(listener) = &channel.presence {
                (listener.on_leave)(diff.clone());
            }
        }
    }
}

impl ChannelTransport for ScriptedTransport {
    fn channel(&self, topic: &str) -> ChannelResult<Box<dyn ChannelHandle>> {
        Ok(Box::new(ScriptedHandle {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            change_filter: None,
            change: None,
            presence: None,
            state: Arc::new(Mutex::new(ChannelState::Joining)),
            subscribed: false,
        }))
    }
}

struct ScriptedHandle {
    inner: Arc<TransportInner>,
    topic: String,
    change_filter: Option<ChangeFilter>,
    change: Option<ChangeListener>,
    presence: Option<PresenceListener>,
    state: Arc<Mutex<ChannelState>>,
    subscribed: bool,
}

#[async_trait]
impl ChannelHandle for ScriptedHandle {
    fn on_changes(&mut self, filter: ChangeFilter, listener: ChangeListener) {
        self.change_filter = Some(filter);
        self.change = Some(listener);
    }

    fn on_presence(&mut self, listener: PresenceListener) {
        self.presence = Some(listener);
    }

    async fn subscribe(&mut self) -> ChannelResult<()> {
        self.inner.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .inner
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubscribeOutcome::Ok);
        match outcome {
            SubscribeOutcome::Ok => {
                *self.state.lock().unwrap() = ChannelState::Joined;
                self.subscribed = true;
                self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
                self.inner
                    .registered
                    .lock()
                    .unwrap()
                    .push(RegisteredChannel {
                        topic: self.topic.clone(),
                        change_filter: self.change_filter.clone(),
                        change: self.change.take(),
                        presence: self.presence.take(),
                        state: self.state.clone(),
                    });
                Ok(())
            }
            SubscribeOutcome::ChannelError(msg) => {
                *self.state.lock().unwrap() = ChannelState::Errored;
                Err(ChannelError::Channel(msg.to_string()))
            }
            SubscribeOutcome::TokenExpired => {
                *self.state.lock().unwrap() = ChannelState::Errored;
                Err(ChannelError::TokenExpired("jwt expired".to_string()))
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if self.subscribed {
            self.subscribed = false;
            self.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
        *self.state.lock().unwrap() = ChannelState::Closed;
    }

    async fn track(&self, record: Value) -> ChannelResult<()> {
        self.inner.tracked.lock().unwrap().push(record);
        Ok(())
    }

    fn presence_state(&self) -> PresenceState {
        PresenceState::new()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }
}

/// Server-side row filtering as the backend applies it: only the
/// `column=eq.value` form the client ever sends.
fn row_matches(filter: &Option<String>, record: &Option<Value>) -> bool {
    let Some(expr) = filter else { return true };
    let Some((column, rest)) = expr.split_once('=') else {
        return true;
    };
    let Some(expected) = rest.strip_prefix("eq.") else {
        return true;
    };
    let Some(record) = record else { return false };
    match record.get(column) {
        Some(Value::String(actual)) => actual == expected,
        Some(actual) => actual.to_string() == expected,
        None => false,
    }
}
