// Common Crate - messages.rs
// common/src/messages.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::models::session::Profile;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogoutReason {
    /// Explicit logout by the user
    UserRequested,
    /// The refresh endpoint rejected the refresh credential
    RefreshRejected,
    /// A hydrated credential failed the identity check at startup
    IdentityRejected,
}

/// Lifecycle notifications published by the token store and channel client.
///
/// UI collaborators subscribe to these; they never mutate session or channel
/// state themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Authenticated {
        identity: Option<Profile>,
    },
    /// A refresh cycle replaced the credential pair
    CredentialsRefreshed,
    LoggedOut {
        reason: LogoutReason,
    },
    Connected {
        identity_id: String,
    },
    Disconnected {
        code: u16,
        reason: String,
    },
    ChannelError {
        message: String,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

/// Fan-out of lifecycle events to any number of listeners
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no listeners is not an error
    pub fn publish(&self, event: LifecycleEvent) {
        tracing::debug!("Lifecycle event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}
