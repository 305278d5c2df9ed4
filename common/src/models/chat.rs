// common/src/models/chat.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::inbound::{correlation_key, EventKind, InboundEvent};

/// Where a conversation entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Fetched from the message history endpoint
    History,
    /// Pushed over the realtime channel
    Pushed,
    /// Optimistic insert made before the server echoed it
    Local,
}

/// One entry of an issue conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable key used for duplicate suppression
    pub id: String,
    pub issue_id: String,
    pub text: String,
    pub from_admin: bool,
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub origin: MessageOrigin,
}

impl ChatMessage {
    /// Read a `new-message` event; `None` for other kinds or frames missing
    /// the issue id or text.
    pub fn from_event(event: &InboundEvent) -> Option<Self> {
        if event.kind != EventKind::NewMessage {
            return None;
        }
        let issue_id = event.issue_id.clone()?;
        let text = event.field("message").or_else(|| event.field("text"))?.to_string();
        let from_admin = event.field("sender") == Some("admin")
            || event
                .payload
                .get("is_admin_message")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let id = event
            .payload
            .get("id")
            .or_else(|| event.payload.get("message_id"))
            .and_then(correlation_key)
            .unwrap_or_else(|| {
                derived_id(&issue_id, event.field("sender").unwrap_or(""), &event.timestamp, &text)
            });

        Some(Self {
            id,
            issue_id,
            text,
            from_admin,
            sender_name: event.field("sender_name").map(str::to_string),
            timestamp: event.timestamp,
            origin: MessageOrigin::Pushed,
        })
    }

    /// Optimistic entry for a message the user just sent
    pub fn local(issue_id: impl Into<String>, text: impl Into<String>, from_admin: bool) -> Self {
        Self {
            id: format!("local-{}", Uuid::new_v4()),
            issue_id: issue_id.into(),
            text: text.into(),
            from_admin,
            sender_name: None,
            timestamp: Utc::now(),
            origin: MessageOrigin::Local,
        }
    }

    /// Whether `other` is plausibly the same message seen through another path
    pub fn same_content(&self, other: &ChatMessage, window: chrono::Duration) -> bool {
        self.issue_id == other.issue_id
            && self.from_admin == other.from_admin
            && self.text == other.text
            && (self.timestamp - other.timestamp).num_milliseconds().abs() <= window.num_milliseconds()
    }
}

/// Deterministic id for frames that carry none, so server repeats collapse
pub fn derived_id(issue_id: &str, sender: &str, timestamp: &DateTime<Utc>, text: &str) -> String {
    let stamp = timestamp.to_rfc3339();
    let mut hasher = Sha256::new();
    for part in [issue_id, sender, stamp.as_str(), text] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("derived-{}", &hex::encode(hasher.finalize())[..16])
}
