// Clawdbot Gateway — Shared Engine Types
//
// Normalized inbound events, model-emitted tool calls, and small helpers
// used across channels, routing, and dispatch.

use serde::{Deserialize, Serialize};

// ── Normalized inbound event ───────────────────────────────────────────

/// What kind of conversation the message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Dm,
    Group,
}

/// A transport-agnostic inbound message. Every adapter translates its wire
/// format into this before handing the event to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport name: "telegram", "webhook", "matrix", …
    pub transport: String,
    /// Account id within the transport ("default" or a named account).
    pub account_id: String,
    /// Stable peer (sender) identifier on the transport.
    pub peer_id: String,
    /// Login-style username, if the transport has one.
    #[serde(default)]
    pub username: Option<String>,
    /// Human display name, if known.
    #[serde(default)]
    pub display_name: Option<String>,
    pub peer_kind: PeerKind,
    /// Group / room / channel id for group messages.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Thread id within the group, where the transport has threads.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Message text (already stripped of transport framing).
    pub text: String,
    /// Transport-native message id, used for reply threading.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Transport update cursor this event was read at, if the transport
    /// uses one (long-poll transports do; webhooks do not).
    #[serde(default)]
    pub update_id: Option<i64>,
    pub received_at: String,
}

impl InboundMessage {
    /// Origin string for session keying: transport, account, peer or
    /// group, and thread when present. Resolvable both ways.
    pub fn origin(&self) -> String {
        let mut origin = match (self.peer_kind, &self.group_id) {
            (PeerKind::Group, Some(gid)) => {
                format!("{}:{}:group:{}", self.transport, self.account_id, gid)
            }
            _ => format!("{}:{}:dm:{}", self.transport, self.account_id, self.peer_id),
        };
        if let Some(tid) = &self.thread_id {
            origin.push_str(":thread:");
            origin.push_str(tid);
        }
        origin
    }
}

// ── Model-emitted tool calls ───────────────────────────────────────────

/// One tool call emitted by the model during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; dispatch executes each id at most once.
    pub id: String,
    pub name: String,
    /// Parsed arguments object. Models emit opaque maps; the dispatch
    /// pipeline validates them against the tool's declared schema.
    pub arguments: serde_json::Value,
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes`, respecting char boundaries.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
