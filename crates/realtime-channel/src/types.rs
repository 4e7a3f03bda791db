//! Shared change-feed and presence types.
//!
//! These types are transport-independent: the websocket transport decodes
//! wire frames into them and test transports construct them directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which database change types a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// All change types (`*` on the wire).
    #[serde(rename = "*")]
    All,
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// Wire representation used in postgres_changes bindings.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventKind::All => "*",
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        }
    }

    /// Parse the wire representation of a delivered change.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "*" => Some(EventKind::All),
            "INSERT" => Some(EventKind::Insert),
            "UPDATE" => Some(EventKind::Update),
            "DELETE" => Some(EventKind::Delete),
            _ => None,
        }
    }

    /// Whether a delivered change of `kind` matches this requested kind.
    pub fn matches(&self, kind: EventKind) -> bool {
        *self == EventKind::All || *self == kind
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A change-feed binding: which rows of which table a channel observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    /// Database schema, default `public`.
    pub schema: String,
    /// Table backing the change feed.
    pub table: String,
    /// Change types to deliver.
    pub event: EventKind,
    /// Optional server-side row filter expression (e.g. `club_id=eq.1`).
    pub filter: Option<String>,
}

impl ChangeFilter {
    /// Create a binding for all change types on a table in `public`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event: EventKind::All,
            filter: None,
        }
    }
}

/// One delivered database change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The change type (never `All` for a delivered event).
    pub kind: EventKind,
    /// Schema the change occurred in.
    pub schema: String,
    /// Table the change occurred in.
    pub table: String,
    /// The new row, absent for deletes.
    pub record: Option<Value>,
    /// The previous row, present for updates and deletes when replicated.
    pub old_record: Option<Value>,
    /// Server commit timestamp, RFC 3339.
    pub commit_timestamp: Option<String>,
}

/// Presence snapshot: participant key to the metadata that participant
/// last tracked. Replaced wholesale on every presence sync.
pub type PresenceState = HashMap<String, Value>;

/// A presence delta delivered on join/leave events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Participants that appeared, keyed by participant key.
    pub joins: PresenceState,
    /// Participants that left, keyed by participant key.
    pub leaves: PresenceState,
}

/// Reported transport state of a channel handle.
///
/// The liveness monitor polls this to catch connections that died without
/// an error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Join request in flight.
    Joining,
    /// Joined and receiving events.
    Joined,
    /// Leave request in flight.
    Leaving,
    /// Connection is gone.
    Closed,
    /// Server reported a channel fault.
    Errored,
}
