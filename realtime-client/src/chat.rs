// realtime-client/src/chat.rs
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use common::{ChatMessage, EventBus, InboundEvent, LifecycleEvent, MessageOrigin};
use session_gateway::{GatewayError, MessagesApi};

use crate::subscribers::Subscriber;

/// How far apart two sightings of the same text may be and still be one message
const ECHO_WINDOW_SECS: i64 = 30;

/// Where missed messages are re-read from after a reconnect
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(&self, issue_id: &str) -> Result<Vec<ChatMessage>, GatewayError>;
}

#[async_trait]
impl HistorySource for MessagesApi {
    async fn history(&self, issue_id: &str) -> Result<Vec<ChatMessage>, GatewayError> {
        self.list(issue_id).await
    }
}

/// Per-issue conversations, deduplicated by message id and kept in
/// timestamp order.
#[derive(Clone, Default)]
pub struct ChatFeed {
    conversations: Arc<DashMap<String, Vec<ChatMessage>>>,
}

impl ChatFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an issue so reconnects re-fetch it
    pub fn track(&self, issue_id: impl Into<String>) {
        self.conversations.entry(issue_id.into()).or_default();
    }

    pub fn tracked(&self) -> Vec<String> {
        self.conversations.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn messages(&self, issue_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .get(issue_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Add one message; returns `false` if it was already present.
    ///
    /// A server copy replaces the matching optimistic local insert, and a
    /// history row replaces a pushed copy that only had a derived id.
    pub fn ingest(&self, message: ChatMessage) -> bool {
        let window = chrono::Duration::seconds(ECHO_WINDOW_SECS);
        let mut conversation = self.conversations.entry(message.issue_id.clone()).or_default();

        if conversation.iter().any(|existing| existing.id == message.id) {
            return false;
        }

        let replaceable = conversation.iter().position(|existing| {
            let supersedes = match (existing.origin, message.origin) {
                (MessageOrigin::Local, MessageOrigin::Pushed | MessageOrigin::History) => true,
                (MessageOrigin::Pushed, MessageOrigin::History) => existing.id.starts_with("derived-"),
                _ => false,
            };
            supersedes && existing.same_content(&message, window)
        });

        match replaceable {
            Some(index) => conversation[index] = message,
            None => conversation.push(message),
        }
        conversation.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        true
    }

    /// Feed a channel event; anything but a well-formed new message is ignored
    pub fn on_event(&self, event: &InboundEvent) -> bool {
        match ChatMessage::from_event(event) {
            Some(message) => self.ingest(message),
            None => false,
        }
    }

    /// Optimistic insert for a message the user just sent
    pub fn insert_local(&self, issue_id: &str, text: &str, from_admin: bool) -> ChatMessage {
        let message = ChatMessage::local(issue_id, text, from_admin);
        self.ingest(message.clone());
        message
    }

    /// Merge a fetched history; returns how many entries changed
    pub fn merge_history(&self, history: Vec<ChatMessage>) -> usize {
        history.into_iter().filter(|message| self.ingest(message.clone())).count()
    }

    /// Re-fetch every tracked conversation and merge it in
    pub async fn resync(&self, source: &dyn HistorySource) -> usize {
        let mut merged = 0;
        for issue_id in self.tracked() {
            match source.history(&issue_id).await {
                Ok(history) => merged += self.merge_history(history),
                Err(e) => tracing::warn!("Could not re-fetch conversation {}: {}", issue_id, e),
            }
        }
        tracing::debug!("Resync merged {} messages", merged);
        merged
    }

    /// Channel subscriber that ingests `new-message` events
    pub fn subscriber(&self) -> Subscriber {
        let feed = self.clone();
        Subscriber::new(move |event| {
            feed.on_event(event);
        })
    }

    /// Re-fetch history on every `Connected` after the first, covering
    /// whatever was pushed while the channel was down.
    pub fn spawn_resync(&self, bus: &EventBus, source: Arc<dyn HistorySource>) -> JoinHandle<()> {
        let feed = self.clone();
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::Connected { .. }) => {
                        if connected_before {
                            feed.resync(source.as_ref()).await;
                        }
                        connected_before = true;
                    }
                    Ok(LifecycleEvent::LoggedOut { .. }) => connected_before = false,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        // Missed events may include a reconnect
                        tracing::warn!("Chat feed lagged {} lifecycle events; resyncing", missed);
                        feed.resync(source.as_ref()).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
