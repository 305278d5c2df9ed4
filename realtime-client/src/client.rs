// realtime-client/src/client.rs
use actix::{Actor, Addr};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use common::{EventKind, InboundEvent};
use session_gateway::TokenStore;

use crate::actors::channel_actor::{
    ChannelActor, ChannelStatus, Connect, Disconnect, GetStatus, SendFrame, Shutdown, Subscribe, Unsubscribe,
};
use crate::backoff::ReconnectPolicy;
use crate::error::ChannelError;
use crate::subscribers::Subscriber;
use crate::transport::ChannelTransport;

/// Identifies one registration made through [`ChannelClient::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub kind: EventKind,
    pub id: Uuid,
}

/// Handle to a running channel actor.
///
/// Must be started from inside an actix system. Commands are queued in
/// order, so a subscription made before `connect` sees the first frame.
#[derive(Clone)]
pub struct ChannelClient {
    addr: Addr<ChannelActor>,
}

impl ChannelClient {
    pub fn start(
        base_url: impl Into<String>,
        policy: ReconnectPolicy,
        store: TokenStore,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        let addr = ChannelActor::new(base_url, policy, store, transport).start();
        Self { addr }
    }

    pub fn connect(&self) {
        self.addr.do_send(Connect);
    }

    /// Manual close; cancels pending reconnects
    pub fn disconnect(&self) {
        self.addr.do_send(Disconnect);
    }

    /// Disconnect and stop the actor
    pub fn stop(&self) {
        self.addr.do_send(Shutdown);
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(kind, Subscriber::new(callback))
    }

    /// Register an existing subscriber; repeating a (kind, subscriber) pair is a no-op
    pub fn subscribe_with(&self, kind: EventKind, subscriber: Subscriber) -> SubscriptionHandle {
        let handle = SubscriptionHandle {
            kind,
            id: subscriber.id,
        };
        self.addr.do_send(Subscribe { kind, subscriber });
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.addr.do_send(Unsubscribe {
            kind: handle.kind,
            id: handle.id,
        });
    }

    /// Push a frame; fails with [`ChannelError::NotConnected`] unless open
    pub async fn send<T: Serialize + ?Sized>(&self, frame: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(frame)?;
        self.addr.send(SendFrame(value)).await?
    }

    pub async fn status(&self) -> Result<ChannelStatus, ChannelError> {
        Ok(self.addr.send(GetStatus).await?)
    }
}
