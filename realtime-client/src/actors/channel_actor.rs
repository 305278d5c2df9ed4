// realtime-client/src/actors/channel_actor.rs
use actix::{Actor, ActorContext, AsyncContext, Context, Handler, Message, MessageResponse, SpawnHandle, StreamHandler};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use common::{identity_from_token, EventKind, LifecycleEvent};
use session_gateway::TokenStore;

use crate::backoff::ReconnectPolicy;
use crate::error::ChannelError;
use crate::routing::{channel_url, parse_frame};
use crate::subscribers::{Subscriber, SubscriberRegistry};
use crate::transport::{ChannelTransport, Link, LinkEvent, CLOSE_ABNORMAL};

/// Code reported when the client itself closes the channel
pub const CLOSE_NORMAL: u16 = 1000;

/// Channel lifecycle.
///
/// A dropped link is either `Reconnecting` (closed, with the next attempt
/// scheduled) or `Idle` (closed for good: never connected, manually
/// disconnected, logged out, or out of attempts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    /// Closed with a reconnect timer pending
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, MessageResponse)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Reconnect attempts since the last successful handshake
    pub attempt: u32,
    pub target_identity: Option<String>,
    pub last_delay: Option<Duration>,
}

/// Start (or keep) the channel open
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect;

/// Close the channel and cancel any pending reconnect
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect;

/// Close the channel and stop the actor
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

#[derive(Message)]
#[rtype(result = "()")]
pub struct Subscribe {
    pub kind: EventKind,
    pub subscriber: Subscriber,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Unsubscribe {
    pub kind: EventKind,
    pub id: Uuid,
}

/// Push a JSON frame on the open channel
#[derive(Message)]
#[rtype(result = "Result<(), ChannelError>")]
pub struct SendFrame(pub Value);

#[derive(Message)]
#[rtype(result = "ChannelStatus")]
pub struct GetStatus;

// Link event tagged with the link generation it came from
#[derive(Message)]
#[rtype(result = "()")]
struct LinkUpdate {
    generation: u64,
    event: LinkEvent,
}

/// Owns the push channel: one link at a time, reconnect timers, and the
/// subscriber registry.
pub struct ChannelActor {
    base_url: String,
    policy: ReconnectPolicy,
    store: TokenStore,
    transport: Arc<dyn ChannelTransport>,
    subscribers: SubscriberRegistry,
    state: ChannelState,
    /// Whether the owner wants the channel up; cleared by manual disconnect
    active: bool,
    attempt: u32,
    /// Bumped per link so events from abandoned links are ignored
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    pending: Option<SpawnHandle>,
    target_identity: Option<String>,
    /// Access credential the current link was opened with
    link_token: Option<String>,
    last_delay: Option<Duration>,
}

impl ChannelActor {
    pub fn new(
        base_url: impl Into<String>,
        policy: ReconnectPolicy,
        store: TokenStore,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            policy,
            store,
            transport,
            subscribers: SubscriberRegistry::new(),
            state: ChannelState::Idle,
            active: false,
            attempt: 0,
            generation: 0,
            outbound: None,
            pending: None,
            target_identity: None,
            link_token: None,
            last_delay: None,
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        self.store.bus().publish(event);
    }

    // Derive the target from the session as it is now, then open a link
    fn open_link(&mut self, ctx: &mut Context<Self>) {
        self.cancel_pending(ctx);
        self.abandon_link();

        let Some(token) = self.store.access_token() else {
            tracing::info!("No session; channel stays closed");
            self.state = ChannelState::Idle;
            return;
        };

        let Some(identity) = identity_from_token(&token) else {
            tracing::warn!("Cannot derive identity from access credential; skipping connect");
            self.state = ChannelState::Idle;
            self.publish(LifecycleEvent::ChannelError {
                message: "cannot derive identity from access credential".to_string(),
            });
            return;
        };

        let url = match channel_url(&self.base_url, &identity, &token) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Not connecting: {}", e);
                self.state = ChannelState::Idle;
                self.publish(LifecycleEvent::ChannelError { message: e.to_string() });
                return;
            }
        };

        tracing::info!("Opening channel for identity {}", identity);
        let Link { outbound, mut events } = self.transport.open(url);
        let generation = self.generation;
        let addr = ctx.address();

        // Forward link events to the actor
        actix::spawn(async move {
            let mut ended = false;
            while let Some(event) = events.recv().await {
                ended = matches!(event, LinkEvent::Closed { .. } | LinkEvent::Failed(_));
                addr.do_send(LinkUpdate { generation, event });
                if ended {
                    break;
                }
            }
            if !ended {
                addr.do_send(LinkUpdate {
                    generation,
                    event: LinkEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "link dropped".to_string(),
                    },
                });
            }
        });

        self.outbound = Some(outbound);
        self.target_identity = Some(identity);
        self.link_token = Some(token);
        self.state = ChannelState::Connecting;
    }

    // Forget the current link; its late events no longer match
    fn abandon_link(&mut self) {
        self.generation += 1;
        self.outbound = None;
        self.link_token = None;
    }

    fn cancel_pending(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.pending.take() {
            ctx.cancel_future(handle);
        }
    }

    fn schedule_reconnect(&mut self, ctx: &mut Context<Self>) {
        if !self.store.is_authenticated() {
            tracing::info!("Session cleared; not reconnecting");
            self.active = false;
            self.state = ChannelState::Idle;
            return;
        }

        self.attempt += 1;
        let Some(delay) = self.policy.delay_for(self.attempt) else {
            let attempts = self.attempt - 1;
            tracing::warn!("Giving up on channel after {} reconnect attempts", attempts);
            self.active = false;
            self.state = ChannelState::Idle;
            self.publish(LifecycleEvent::ReconnectExhausted { attempts });
            return;
        };

        tracing::info!("Reconnecting in {:?} (attempt {})", delay, self.attempt);
        self.state = ChannelState::Reconnecting;
        self.last_delay = Some(delay);
        self.publish(LifecycleEvent::ReconnectScheduled {
            attempt: self.attempt,
            delay,
        });

        self.pending = Some(ctx.run_later(delay, |act, ctx| {
            act.pending = None;
            act.open_link(ctx);
        }));
    }

    fn stop(&mut self, ctx: &mut Context<Self>, reason: &str) {
        self.active = false;
        self.cancel_pending(ctx);
        let was_live = matches!(self.state, ChannelState::Open | ChannelState::Connecting);
        self.abandon_link();
        self.state = ChannelState::Idle;
        self.attempt = 0;

        if was_live {
            tracing::info!("Channel closed: {}", reason);
            self.publish(LifecycleEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
    }

    fn on_credentials_changed(&mut self, ctx: &mut Context<Self>) {
        if !self.active {
            return;
        }
        match self.state {
            ChannelState::Idle => self.open_link(ctx),
            ChannelState::Open | ChannelState::Connecting => {
                if self.store.access_token() != self.link_token {
                    tracing::info!("Access credential changed; reopening channel");
                    self.attempt = 0;
                    self.open_link(ctx);
                }
            }
            // The pending attempt re-derives the identity when it fires
            ChannelState::Reconnecting => {}
        }
    }

    fn on_link_event(&mut self, event: LinkEvent, ctx: &mut Context<Self>) {
        match event {
            LinkEvent::Opened => {
                self.state = ChannelState::Open;
                self.attempt = 0;
                self.last_delay = None;
                let identity_id = self.target_identity.clone().unwrap_or_default();
                tracing::info!("Channel connected for identity {}", identity_id);
                self.publish(LifecycleEvent::Connected { identity_id });
            }
            LinkEvent::Frame(text) => {
                if let Some(event) = parse_frame(&text, Utc::now()) {
                    let delivered = self.subscribers.dispatch(&event);
                    tracing::trace!("{} frame delivered to {} subscribers", event.kind, delivered);
                }
            }
            LinkEvent::Closed { code, reason } => {
                self.outbound = None;
                tracing::info!("Channel closed by transport: {} {}", code, reason);
                self.publish(LifecycleEvent::Disconnected { code, reason });
                self.on_link_lost(ctx);
            }
            LinkEvent::Failed(message) => {
                self.outbound = None;
                self.publish(LifecycleEvent::ChannelError { message });
                self.on_link_lost(ctx);
            }
        }
    }

    fn on_link_lost(&mut self, ctx: &mut Context<Self>) {
        if self.active {
            self.schedule_reconnect(ctx);
        } else {
            self.state = ChannelState::Idle;
        }
    }
}

impl Actor for ChannelActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("Channel actor started");
        ctx.add_stream(BroadcastStream::new(self.store.bus().subscribe()));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::debug!("Channel actor stopped");
    }
}

impl Handler<Connect> for ChannelActor {
    type Result = ();

    fn handle(&mut self, _msg: Connect, ctx: &mut Self::Context) -> Self::Result {
        self.active = true;
        match self.state {
            ChannelState::Open | ChannelState::Connecting => {
                tracing::debug!("Channel already up");
            }
            ChannelState::Idle | ChannelState::Reconnecting => {
                self.attempt = 0;
                self.open_link(ctx);
            }
        }
    }
}

impl Handler<Disconnect> for ChannelActor {
    type Result = ();

    fn handle(&mut self, _msg: Disconnect, ctx: &mut Self::Context) -> Self::Result {
        self.stop(ctx, "client disconnect");
    }
}

impl Handler<Subscribe> for ChannelActor {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _ctx: &mut Self::Context) -> Self::Result {
        if !self.subscribers.register(msg.kind, msg.subscriber) {
            tracing::debug!("Subscriber already registered for {}", msg.kind);
        }
    }
}

impl Handler<Unsubscribe> for ChannelActor {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Self::Context) -> Self::Result {
        self.subscribers.unregister(msg.kind, msg.id);
    }
}

impl Handler<SendFrame> for ChannelActor {
    type Result = Result<(), ChannelError>;

    fn handle(&mut self, msg: SendFrame, _ctx: &mut Self::Context) -> Self::Result {
        let outbound = match (&self.state, &self.outbound) {
            (ChannelState::Open, Some(outbound)) => outbound,
            _ => return Err(ChannelError::NotConnected),
        };
        let text = serde_json::to_string(&msg.0)?;
        outbound.try_send(text).map_err(|_| ChannelError::NotConnected)
    }
}

impl Handler<GetStatus> for ChannelActor {
    type Result = ChannelStatus;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        ChannelStatus {
            state: self.state,
            attempt: self.attempt,
            target_identity: self.target_identity.clone(),
            last_delay: self.last_delay,
        }
    }
}

impl Handler<LinkUpdate> for ChannelActor {
    type Result = ();

    fn handle(&mut self, msg: LinkUpdate, ctx: &mut Self::Context) -> Self::Result {
        if msg.generation != self.generation {
            tracing::trace!("Ignoring event from abandoned link {}", msg.generation);
            return;
        }
        self.on_link_event(msg.event, ctx);
    }
}

impl StreamHandler<Result<LifecycleEvent, BroadcastStreamRecvError>> for ChannelActor {
    fn handle(&mut self, item: Result<LifecycleEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(LifecycleEvent::LoggedOut { reason }) => {
                self.stop(ctx, &format!("logged out ({:?})", reason));
            }
            Ok(LifecycleEvent::Authenticated { .. }) | Ok(LifecycleEvent::CredentialsRefreshed) => {
                self.on_credentials_changed(ctx);
            }
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                // The missed events may include a logout or a new credential
                tracing::warn!("Channel actor missed {} lifecycle events; re-reading session", missed);
                if self.store.is_authenticated() {
                    self.on_credentials_changed(ctx);
                } else {
                    self.stop(ctx, "session ended");
                }
            }
        }
    }

    // The bus outlives the actor; if it ever ends, keep running
    fn finished(&mut self, _ctx: &mut Self::Context) {
        tracing::debug!("Lifecycle stream ended");
    }
}

impl Handler<Shutdown> for ChannelActor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        self.stop(ctx, "shutdown");
        ctx.stop();
    }
}
