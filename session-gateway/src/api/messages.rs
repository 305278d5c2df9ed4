// session-gateway/src/api/messages.rs
use chrono::Utc;
use serde::{Deserialize, Serialize};

use common::{parse_timestamp, ChatMessage, MessageOrigin};

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::transport::ApiRequest;

// Row of the message history endpoint
#[derive(Debug, Deserialize)]
struct HistoryRow {
    id: i64,
    issue_id: i64,
    message: String,
    #[serde(default)]
    is_admin_message: bool,
    created_at: String,
    #[serde(default)]
    sender_name: Option<String>,
}

impl From<HistoryRow> for ChatMessage {
    fn from(row: HistoryRow) -> Self {
        let timestamp = parse_timestamp(&row.created_at).unwrap_or_else(|| {
            tracing::debug!("Unparseable created_at {:?} on message {}", row.created_at, row.id);
            Utc::now()
        });
        ChatMessage {
            id: row.id.to_string(),
            issue_id: row.issue_id.to_string(),
            text: row.message,
            from_admin: row.is_admin_message,
            sender_name: row.sender_name,
            timestamp,
            origin: MessageOrigin::History,
        }
    }
}

#[derive(Serialize)]
struct NewMessage<'a> {
    message: &'a str,
}

/// Server acknowledgement of a posted message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendReceipt {
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<i64>,
}

/// Issue conversation endpoints
#[derive(Clone)]
pub struct MessagesApi {
    gateway: Gateway,
}

impl MessagesApi {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Full history of one issue conversation
    pub async fn list(&self, issue_id: &str) -> Result<Vec<ChatMessage>, GatewayError> {
        let rows: Vec<HistoryRow> = self
            .gateway
            .send_json(ApiRequest::get(format!("/messages/issues/{}/messages", issue_id)))
            .await?;
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    pub async fn send(&self, issue_id: &str, text: &str) -> Result<SendReceipt, GatewayError> {
        let request = ApiRequest::post(format!("/messages/issues/{}/messages", issue_id))
            .with_json(&NewMessage { message: text })?;
        self.gateway.send_json(request).await
    }

    /// Idempotent; independent of channel state
    pub async fn mark_read(&self, issue_id: &str) -> Result<(), GatewayError> {
        let response = self
            .gateway
            .send(ApiRequest::patch(format!("/messages/issues/{}/read", issue_id)))
            .await?;
        if !response.is_success() {
            return Err(GatewayError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(())
    }
}
