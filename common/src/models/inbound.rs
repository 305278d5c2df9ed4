// common/src/models/inbound.rs
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tag of a server-pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    NewMessage,
    StatusNotification,
    Generic,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::NewMessage,
        EventKind::StatusNotification,
        EventKind::Generic,
    ];

    /// Map a frame discriminator onto a kind; unknown tags are generic
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "new_message" | "new-message" => EventKind::NewMessage,
            "notification"
            | "status_notification"
            | "status-notification"
            | "issue_update" => EventKind::StatusNotification,
            _ => EventKind::Generic,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::NewMessage => "new-message",
            EventKind::StatusNotification => "status-notification",
            EventKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// A unit pushed over the realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    /// The whole frame as received
    pub payload: Value,
    pub issue_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Build an event from a decoded frame, received at `arrived_at`.
    ///
    /// The discriminator is read from `kind`, then `type`.
    pub fn from_frame(payload: Value, arrived_at: DateTime<Utc>) -> Self {
        let kind = payload
            .get("kind")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .map(EventKind::from_tag)
            .unwrap_or(EventKind::Generic);

        let issue_id = payload
            .get("issue_id")
            .or_else(|| payload.get("issueId"))
            .and_then(correlation_key);

        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(arrived_at);

        Self {
            kind,
            payload,
            issue_id,
            timestamp,
        }
    }

    /// String field of the payload, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

pub(crate) fn correlation_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
