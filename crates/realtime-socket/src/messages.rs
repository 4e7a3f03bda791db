//! Phoenix wire frames for the realtime websocket.
//!
//! Every frame on the socket is one JSON object with `topic`, `event`,
//! `payload` and `ref` fields. Channels join under the `realtime:` topic
//! prefix; heartbeats go to the reserved `phoenix` topic.

use realtime_channel::{ChangeEvent, ChangeFilter, EventKind, PresenceDiff, PresenceState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Topic prefix for user channels.
pub const TOPIC_PREFIX: &str = "realtime:";
/// Reserved topic for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SYSTEM: &str = "system";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_PRESENCE: &str = "presence";

/// One frame on the socket, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub message_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn join(topic: &str, payload: Value, message_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload,
            message_ref: Some(message_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, message_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            message_ref: Some(message_ref.to_string()),
        }
    }

    pub fn heartbeat(message_ref: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            message_ref: Some(message_ref.to_string()),
        }
    }

    /// Publish this client's presence record into a joined channel.
    pub fn track(topic: &str, record: Value, message_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_PRESENCE.to_string(),
            payload: json!({
                "type": "presence",
                "event": "track",
                "payload": record,
            }),
            message_ref: Some(message_ref.to_string()),
        }
    }
}

/// Wire topic for a channel name (`realtime:<name>`).
pub fn wire_topic(channel_name: &str) -> String {
    format!("{TOPIC_PREFIX}{channel_name}")
}

/// Build the `phx_join` payload: change-feed bindings, presence config
/// and the access token the server authorizes against.
pub fn join_payload(
    change: Option<&ChangeFilter>,
    presence_key: Option<&str>,
    access_token: &str,
) -> Value {
    let postgres_changes = match change {
        Some(filter) => {
            let mut binding = json!({
                "event": filter.event.as_wire(),
                "schema": filter.schema,
                "table": filter.table,
            });
            if let Some(expr) = &filter.filter {
                binding["filter"] = json!(expr);
            }
            json!([binding])
        }
        None => json!([]),
    };

    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": presence_key.unwrap_or("") },
            "postgres_changes": postgres_changes,
        },
        "access_token": access_token,
    })
}

/// Server verdict carried in a `phx_reply` payload.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error(String),
}

/// Parse a `phx_reply` payload into its verdict.
pub fn parse_reply(payload: &Value) -> ReplyStatus {
    if payload.get("status").and_then(Value::as_str) == Some("ok") {
        return ReplyStatus::Ok;
    }
    let response = payload.get("response");
    let reason = response
        .and_then(|r| r.get("reason").or_else(|| r.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            response
                .map(Value::to_string)
                .unwrap_or_else(|| "join rejected".to_string())
        });
    ReplyStatus::Error(reason)
}

/// Decode a `postgres_changes` payload into a [`ChangeEvent`].
///
/// Returns `None` for frames this client has no binding for, or whose
/// change type is unknown.
pub fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let kind = EventKind::from_wire(data.get("type")?.as_str()?)?;
    let non_null = |v: Option<&Value>| v.filter(|v| !v.is_null()).cloned();
    Some(ChangeEvent {
        kind,
        schema: data
            .get("schema")
            .and_then(Value::as_str)
            .unwrap_or("public")
            .to_string(),
        table: data
            .get("table")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        record: non_null(data.get("record")),
        old_record: non_null(data.get("old_record")),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Flatten a presence payload (key to `{"metas": [..]}`) into the
/// snapshot shape: key to that participant's first meta.
pub fn flatten_presence(payload: &Value) -> PresenceState {
    let mut state = PresenceState::new();
    let Some(entries) = payload.as_object() else {
        return state;
    };
    for (key, entry) in entries {
        let meta = entry
            .get("metas")
            .and_then(|m| m.get(0))
            .cloned()
            .unwrap_or_else(|| entry.clone());
        state.insert(key.clone(), meta);
    }
    state
}

/// Decode a `presence_diff` payload.
pub fn decode_presence_diff(payload: &Value) -> PresenceDiff {
    PresenceDiff {
        joins: flatten_presence(payload.get("joins").unwrap_or(&Value::Null)),
        leaves: flatten_presence(payload.get("leaves").unwrap_or(&Value::Null)),
    }
}
