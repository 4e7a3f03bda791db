//! Websocket-backed channel handles.
//!
//! Each handle owns one websocket connection for the lifetime of one
//! subscription: subscribe dials, joins and spawns the writer, heartbeat
//! and reader tasks; unsubscribe sends `phx_leave` and tears them down.

use crate::config::SocketConfig;
use crate::messages::{
    decode_change, decode_presence_diff, flatten_presence, join_payload, parse_reply, wire_topic,
    PhoenixMessage, ReplyStatus, EVENT_CLOSE, EVENT_ERROR, EVENT_POSTGRES_CHANGES,
    EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE, EVENT_REPLY, EVENT_SYSTEM, PHOENIX_TOPIC,
};
use async_trait::async_trait;
use auth_events::AuthState;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use realtime_channel::{
    ChangeFilter, ChangeListener, ChannelError, ChannelHandle, ChannelResult, ChannelState,
    ChannelTransport, PresenceListener, PresenceState,
};
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`ChannelTransport`] over the hosted realtime websocket.
///
/// One websocket per channel handle; the socket carries the caller's
/// access token when signed in and the project api key otherwise.
pub struct RealtimeSocket {
    config: SocketConfig,
    auth: Arc<AuthState>,
}

impl RealtimeSocket {
    pub fn new(config: SocketConfig, auth: Arc<AuthState>) -> Self {
        Self { config, auth }
    }
}

impl ChannelTransport for RealtimeSocket {
    fn channel(&self, topic: &str) -> ChannelResult<Box<dyn ChannelHandle>> {
        if topic.is_empty() {
            return Err(ChannelError::Config(
                "channel topic must not be empty".to_string(),
            ));
        }
        Ok(Box::new(SocketChannel::new(
            self.config.clone(),
            self.auth.clone(),
            topic,
        )))
    }
}

impl std::fmt::Debug for RealtimeSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSocket")
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

struct SocketChannel {
    config: SocketConfig,
    auth: Arc<AuthState>,
    wire_topic: String,
    change_filter: Option<ChangeFilter>,
    change: Option<ChangeListener>,
    presence: Option<PresenceListener>,
    state: Arc<Mutex<ChannelState>>,
    snapshot: Arc<Mutex<PresenceState>>,
    outbound: Option<mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    next_ref: AtomicU64,
}

impl SocketChannel {
    fn new(config: SocketConfig, auth: Arc<AuthState>, channel_name: &str) -> Self {
        Self {
            config,
            auth,
            wire_topic: wire_topic(channel_name),
            change_filter: None,
            change: None,
            presence: None,
            state: Arc::new(Mutex::new(ChannelState::Joining)),
            snapshot: Arc::new(Mutex::new(PresenceState::new())),
            outbound: None,
            writer: None,
            tasks: Vec::new(),
            next_ref: AtomicU64::new(1),
        }
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("lock poisoned") = state;
    }

    fn endpoint_url(&self) -> ChannelResult<Url> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|err| ChannelError::Config(format!("invalid endpoint: {err}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.config.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

#[async_trait]
impl ChannelHandle for SocketChannel {
    fn on_changes(&mut self, filter: ChangeFilter, listener: ChangeListener) {
        self.change_filter = Some(filter);
        self.change = Some(listener);
    }

    fn on_presence(&mut self, listener: PresenceListener) {
        self.presence = Some(listener);
    }

    async fn subscribe(&mut self) -> ChannelResult<()> {
        let url = self.endpoint_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        let (mut write, mut read) = socket.split();
        debug!(topic = %self.wire_topic, "websocket connected");

        let access_token = match self.auth.session().await {
            Some(session) => session.access_token,
            None => self.config.api_key.clone(),
        };

        let join_ref = self.make_ref();
        let join = PhoenixMessage::join(
            &self.wire_topic,
            join_payload(
                self.change_filter.as_ref(),
                self.presence.as_ref().map(|_| ""),
                &access_token,
            ),
            &join_ref,
        );
        write
            .send(Message::Text(serde_json::to_string(&join)?.into()))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;

        timeout(
            Duration::from_secs(self.config.subscribe_timeout_secs),
            await_join_reply(&mut read, &join_ref),
        )
        .await
        .map_err(|_| ChannelError::TimedOut)??;

        self.set_state(ChannelState::Joined);
        debug!(topic = %self.wire_topic, "channel joined");

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);

        // Set when a heartbeat goes out, cleared when its reply comes
        // back on the phoenix topic. Still set at the next tick means
        // the socket is half-open.
        let pending_heartbeat = Arc::new(AtomicBool::new(false));

        // Writer: the only task that touches the sink.
        let writer_topic = self.wire_topic.clone();
        let writer_state = self.state.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = write.send(message).await {
                    warn!(topic = %writer_topic, error = %err, "websocket send failed");
                    *writer_state.lock().expect("lock poisoned") = ChannelState::Closed;
                    break;
                }
            }
        });

        // Heartbeat: keeps the socket open between channel events and
        // catches half-open connections the reader never notices.
        let heartbeat_tx = outbound.clone();
        let heartbeat_pending = pending_heartbeat.clone();
        let heartbeat_state = self.state.clone();
        let heartbeat_topic = self.wire_topic.clone();
        let heartbeat_secs = self.config.heartbeat_interval_secs;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(heartbeat_secs));
            ticker.tick().await;
            let mut counter = 0u64;
            loop {
                ticker.tick().await;
                if heartbeat_pending.swap(true, Ordering::SeqCst) {
                    warn!(topic = %heartbeat_topic, "heartbeat reply missed, marking channel closed");
                    *heartbeat_state.lock().expect("lock poisoned") = ChannelState::Closed;
                    break;
                }
                counter += 1;
                let frame = PhoenixMessage::heartbeat(&format!("hb-{counter}"));
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if heartbeat_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader: dispatches frames to listeners until the socket dies.
        let state = self.state.clone();
        let snapshot = self.snapshot.clone();
        let change = self.change.take();
        let presence = self.presence.take();
        let pong_tx = outbound.clone();
        let reader_pending = pending_heartbeat.clone();
        let reader_topic = self.wire_topic.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if dispatch_frame(&text, &change, &presence, &snapshot, &reader_pending)
                            .is_break()
                        {
                            warn!(topic = %reader_topic, "channel closed by server");
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        debug!(topic = %reader_topic, "websocket closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(topic = %reader_topic, error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            *state.lock().expect("lock poisoned") = ChannelState::Closed;
        });

        self.outbound = Some(outbound);
        self.writer = Some(writer);
        self.tasks = vec![heartbeat, reader];
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        self.set_state(ChannelState::Leaving);
        // Heartbeat and reader hold sender clones; stop them first so
        // dropping our sender closes the queue.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(outbound) = self.outbound.take() {
            let leave = PhoenixMessage::leave(&self.wire_topic, &self.make_ref());
            if let Ok(text) = serde_json::to_string(&leave) {
                let _ = outbound.send(Message::Text(text.into())).await;
            }
        }
        // Let the writer flush the leave frame before tearing down.
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if timeout(Duration::from_secs(1), writer).await.is_err() {
                abort.abort();
            }
        }
        self.set_state(ChannelState::Closed);
        debug!(topic = %self.wire_topic, "channel released");
    }

    async fn track(&self, record: Value) -> ChannelResult<()> {
        let Some(outbound) = &self.outbound else {
            return Err(ChannelError::Closed);
        };
        let frame = PhoenixMessage::track(&self.wire_topic, record, &self.make_ref());
        outbound
            .send(Message::Text(serde_json::to_string(&frame)?.into()))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn presence_state(&self) -> PresenceState {
        self.snapshot.lock().expect("lock poisoned").clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("lock poisoned")
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Read frames until the join reply for `join_ref` arrives.
async fn await_join_reply(read: &mut SplitStream<WsStream>, join_ref: &str) -> ChannelResult<()> {
    while let Some(result) = read.next().await {
        let text = match result.map_err(|err| ChannelError::Transport(err.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(ChannelError::Closed),
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<PhoenixMessage>(&text) else {
            continue;
        };
        if frame.event == EVENT_REPLY && frame.message_ref.as_deref() == Some(join_ref) {
            return match parse_reply(&frame.payload) {
                ReplyStatus::Ok => Ok(()),
                ReplyStatus::Error(reason) => Err(classify_rejection(reason)),
            };
        }
        // The server surfaces some faults as system frames before any reply.
        if frame.event == EVENT_SYSTEM
            && frame.payload.get("status").and_then(Value::as_str) == Some("error")
        {
            let reason = frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("channel fault")
                .to_string();
            return Err(classify_rejection(reason));
        }
    }
    Err(ChannelError::Closed)
}

/// Map a join rejection to the token-expiry class when the server's
/// wording indicates an auth failure.
fn classify_rejection(reason: String) -> ChannelError {
    let probe = ChannelError::Channel(reason.clone());
    if probe.is_token_expired() {
        ChannelError::TokenExpired(reason)
    } else {
        probe
    }
}

/// Dispatch one decoded frame; `Break` means the channel is gone.
fn dispatch_frame(
    text: &str,
    change: &Option<ChangeListener>,
    presence: &Option<PresenceListener>,
    snapshot: &Arc<Mutex<PresenceState>>,
    pending_heartbeat: &AtomicBool,
) -> ControlFlow<()> {
    let Ok(frame) = serde_json::from_str::<PhoenixMessage>(text) else {
        trace!("ignoring undecodable frame");
        return ControlFlow::Continue(());
    };
    match frame.event.as_str() {
        EVENT_REPLY if frame.topic == PHOENIX_TOPIC => {
            pending_heartbeat.store(false, Ordering::SeqCst);
            ControlFlow::Continue(())
        }
        EVENT_POSTGRES_CHANGES => {
            if let Some(event) = decode_change(&frame.payload) {
                if let Some(listener) = change {
                    listener(event);
                }
            }
            ControlFlow::Continue(())
        }
        EVENT_PRESENCE_STATE => {
            let state = flatten_presence(&frame.payload);
            *snapshot.lock().expect("lock poisoned") = state.clone();
            if let Some(listener) = presence {
                (listener.on_sync)(state);
            }
            ControlFlow::Continue(())
        }
        EVENT_PRESENCE_DIFF => {
            let diff = decode_presence_diff(&frame.payload);
            {
                let mut snapshot = snapshot.lock().expect("lock poisoned");
                for key in diff.leaves.keys() {
                    snapshot.remove(key);
                }
                for (key, meta) in &diff.joins {
                    snapshot.insert(key.clone(), meta.clone());
                }
            }
            if let Some(listener) = presence {
                if !diff.joins.is_empty() {
                    (listener.on_join)(diff.clone());
                }
                if !diff.leaves.is_empty() {
                    (listener.on_leave)(diff);
                }
            }
            ControlFlow::Continue(())
        }
        EVENT_CLOSE | EVENT_ERROR => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_channel::{ChangeEvent, PresenceDiff};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn frame(event: &str, payload: Value) -> String {
        serde_json::to_string(&PhoenixMessage {
            topic: "realtime:matches_club_1".to_string(),
            event: event.to_string(),
            payload,
            message_ref: None,
        })
        .unwrap()
    }

    #[test]
    fn endpoint_url_carries_api_key() {
        let channel = SocketChannel::new(
            SocketConfig::new("wss://example.test/realtime/v1/websocket", "anon-key"),
            AuthState::new(),
            "matches_club_1",
        );
        let url = channel.endpoint_url().unwrap();
        assert!(url.as_str().contains("apikey=anon-key"));
        assert!(url.as_str().contains("vsn=1.0.0"));
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let channel = SocketChannel::new(
            SocketConfig::new("not a url", "anon-key"),
            AuthState::new(),
            "matches_club_1",
        );
        assert!(matches!(
            channel.endpoint_url(),
            Err(ChannelError::Config(_))
        ));
    }

    #[test]
    fn rejection_classification() {
        assert!(matches!(
            classify_rejection("jwt expired".to_string()),
            ChannelError::TokenExpired(_)
        ));
        assert!(matches!(
            classify_rejection("table not in publication".to_string()),
            ChannelError::Channel(_)
        ));
    }

    #[test]
    fn dispatch_delivers_matching_change() {
        let delivered = Arc::new(Mutex::new(Vec::<ChangeEvent>::new()));
        let sink = delivered.clone();
        let change: Option<ChangeListener> = Some(Box::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        let snapshot = Arc::new(Mutex::new(PresenceState::new()));

        let text = frame(
            EVENT_POSTGRES_CHANGES,
            json!({"data": {"type": "INSERT", "schema": "public", "table": "matches",
                   "record": {"id": 5}}}),
        );
        let pending = AtomicBool::new(false);
        assert!(dispatch_frame(&text, &change, &None, &snapshot, &pending).is_continue());

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].record.as_ref().unwrap()["id"], 5);
    }

    #[test]
    fn dispatch_updates_snapshot_on_state_and_diff() {
        let syncs = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));
        let leaves = Arc::new(AtomicUsize::new(0));
        let (s, j, l) = (syncs.clone(), joins.clone(), leaves.clone());
        let presence: Option<PresenceListener> = Some(PresenceListener {
            on_sync: Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            on_join: Box::new(move |_: PresenceDiff| {
                j.fetch_add(1, Ordering::SeqCst);
            }),
            on_leave: Box::new(move |_: PresenceDiff| {
                l.fetch_add(1, Ordering::SeqCst);
            }),
        });
        let snapshot = Arc::new(Mutex::new(PresenceState::new()));
        let pending = AtomicBool::new(false);

        let text = frame(
            EVENT_PRESENCE_STATE,
            json!({"user-1": {"metas": [{"online_at": "a"}]},
                   "user-2": {"metas": [{"online_at": "b"}]}}),
        );
        dispatch_frame(&text, &None, &presence, &snapshot, &pending);
        assert_eq!(snapshot.lock().unwrap().len(), 2);
        assert_eq!(syncs.load(Ordering::SeqCst), 1);

        let text = frame(
            EVENT_PRESENCE_DIFF,
            json!({"joins": {"user-3": {"metas": [{"online_at": "c"}]}},
                   "leaves": {"user-1": {"metas": [{"online_at": "a"}]}}}),
        );
        dispatch_frame(&text, &None, &presence, &snapshot, &pending);
        let snapshot = snapshot.lock().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("user-3"));
        assert!(!snapshot.contains_key("user-1"));
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_breaks_on_channel_close() {
        let snapshot = Arc::new(Mutex::new(PresenceState::new()));
        let pending = AtomicBool::new(false);
        let text = frame(EVENT_CLOSE, json!({}));
        assert!(dispatch_frame(&text, &None, &None, &snapshot, &pending).is_break());
        let text = frame(EVENT_ERROR, json!({}));
        assert!(dispatch_frame(&text, &None, &None, &snapshot, &pending).is_break());
    }

    #[test]
    fn phoenix_reply_clears_pending_heartbeat() {
        let snapshot = Arc::new(Mutex::new(PresenceState::new()));
        let pending = AtomicBool::new(true);

        // A reply on a channel topic is not a heartbeat acknowledgement.
        let text = frame(EVENT_REPLY, json!({"status": "ok", "response": {}}));
        dispatch_frame(&text, &None, &None, &snapshot, &pending);
        assert!(pending.load(Ordering::SeqCst));

        let text = serde_json::to_string(&PhoenixMessage {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_REPLY.to_string(),
            payload: json!({"status": "ok", "response": {}}),
            message_ref: Some("hb-1".to_string()),
        })
        .unwrap();
        dispatch_frame(&text, &None, &None, &snapshot, &pending);
        assert!(!pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn leave_frame_reaches_the_wire_on_unsubscribe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            let joined = socket.next().await.unwrap().unwrap();
            let join: PhoenixMessage = serde_json::from_str(joined.to_text().unwrap()).unwrap();
            assert_eq!(join.event, "phx_join");
            let reply = PhoenixMessage {
                topic: join.topic.clone(),
                event: EVENT_REPLY.to_string(),
                payload: json!({"status": "ok", "response": {}}),
                message_ref: join.message_ref.clone(),
            };
            socket
                .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                .await
                .unwrap();

            while let Some(Ok(message)) = socket.next().await {
                let Ok(text) = message.to_text() else { continue };
                let Ok(frame) = serde_json::from_str::<PhoenixMessage>(text) else {
                    continue;
                };
                if frame.event == "phx_leave" {
                    return frame;
                }
            }
            panic!("socket closed before phx_leave arrived");
        });

        let transport = RealtimeSocket::new(
            SocketConfig::new(format!("ws://{addr}"), "anon-key"),
            AuthState::new(),
        );
        let mut handle = transport.channel("matches_club_1").unwrap();
        handle.subscribe().await.unwrap();
        assert_eq!(handle.state(), ChannelState::Joined);

        handle.unsubscribe().await;
        assert_eq!(handle.state(), ChannelState::Closed);

        let leave = timeout(Duration::from_secs(5), server)
            .await
            .expect("server never saw the leave frame")
            .unwrap();
        assert_eq!(leave.topic, "realtime:matches_club_1");
    }
}
