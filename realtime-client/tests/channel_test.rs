// realtime-client/tests/channel_test.rs
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use url::Url;

use common::{Credentials, EventBus, EventKind, LifecycleEvent};
use realtime_client::{
    ChannelClient, ChannelError, ChannelState, ChannelTransport, Link, LinkEvent, ReconnectPolicy,
};
use session_gateway::{MemoryCredentialMirror, TokenStore};

/// Test-side ends of one opened link
struct FakeLink {
    url: Url,
    events: mpsc::Sender<LinkEvent>,
    outbound: mpsc::Receiver<String>,
}

impl FakeLink {
    async fn emit(&self, event: LinkEvent) {
        self.events.send(event).await.unwrap();
    }

    fn identity(&self) -> String {
        self.url.path().rsplit('/').next().unwrap().to_string()
    }
}

struct FakeTransport {
    opened: mpsc::UnboundedSender<FakeLink>,
}

impl ChannelTransport for FakeTransport {
    fn open(&self, url: Url) -> Link {
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(8);
        let _ = self.opened.send(FakeLink {
            url,
            events: events_tx,
            outbound: outbound_rx,
        });
        Link {
            outbound: outbound_tx,
            events: events_rx,
        }
    }
}

fn token_for(sub: &str) -> String {
    issued_token(sub, 0)
}

/// Distinct tokens for the same subject, as a rotation would hand out
fn issued_token(sub: &str, serial: u32) -> String {
    encode(
        &Header::default(),
        &json!({ "sub": sub, "exp": 4_000_000_000u64, "jti": serial }),
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

fn credentials_for(sub: &str) -> Credentials {
    Credentials {
        access_token: token_for(sub),
        refresh_token: format!("refresh-{}", sub),
    }
}

fn token_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        max_attempts: 3,
    }
}

struct Harness {
    store: TokenStore,
    client: ChannelClient,
    links: mpsc::UnboundedReceiver<FakeLink>,
    events: broadcast::Receiver<LifecycleEvent>,
}

fn harness() -> Harness {
    harness_on(EventBus::default())
}

fn harness_on(bus: EventBus) -> Harness {
    let store = TokenStore::new(Arc::new(MemoryCredentialMirror::new()), bus);
    store.establish(credentials_for("42"), None);
    let events = store.bus().subscribe();

    let (opened, links) = mpsc::unbounded_channel();
    let client = ChannelClient::start(
        "ws://portal.test/notifications",
        policy(),
        store.clone(),
        Arc::new(FakeTransport { opened }),
    );

    Harness {
        store,
        client,
        links,
        events,
    }
}

async fn next_link(links: &mut mpsc::UnboundedReceiver<FakeLink>) -> FakeLink {
    tokio::time::timeout(Duration::from_secs(120), links.recv())
        .await
        .expect("no link opened")
        .unwrap()
}

/// Skip ahead to the first event `pick` accepts
async fn wait_for<T>(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    mut pick: impl FnMut(LifecycleEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("lifecycle event did not arrive")
            .unwrap();
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

async fn scheduled(events: &mut broadcast::Receiver<LifecycleEvent>) -> (u32, Duration) {
    wait_for(events, |event| match event {
        LifecycleEvent::ReconnectScheduled { attempt, delay } => Some((attempt, delay)),
        _ => None,
    })
    .await
}

#[actix::test]
async fn test_connect_targets_identity_from_token() {
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    assert_eq!(link.url.path(), "/notifications/ws/updates/42");
    let token = h.store.access_token().unwrap();
    assert!(link.url.query_pairs().any(|(k, v)| k == "token" && v == token));

    link.emit(LinkEvent::Opened).await;
    let identity = wait_for(&mut h.events, |event| match event {
        LifecycleEvent::Connected { identity_id } => Some(identity_id),
        _ => None,
    })
    .await;
    assert_eq!(identity, "42");
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Open);
}

#[actix::test]
async fn test_abnormal_closes_back_off_exponentially() {
    tokio::time::pause();
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    link.emit(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    assert_eq!(scheduled(&mut h.events).await, (1, Duration::from_secs(1)));

    // The retry never completes its handshake
    let retry = next_link(&mut h.links).await;
    retry.emit(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    assert_eq!(scheduled(&mut h.events).await, (2, Duration::from_secs(2)));

    let status = h.client.status().await.unwrap();
    assert_eq!(status.state, ChannelState::Reconnecting);
    assert_eq!(status.last_delay, Some(Duration::from_secs(2)));

    // A successful handshake resets the schedule
    let third = next_link(&mut h.links).await;
    third.emit(LinkEvent::Opened).await;
    third.emit(LinkEvent::Closed { code: 1011, reason: "server restart".into() }).await;
    assert_eq!(scheduled(&mut h.events).await, (1, Duration::from_secs(1)));
}

#[actix::test]
async fn test_disconnect_cancels_pending_reconnect() {
    tokio::time::pause();
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    link.emit(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    scheduled(&mut h.events).await;

    h.client.disconnect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(h.links.try_recv().is_err());
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Idle);
}

#[actix::test]
async fn test_reconnect_uses_refreshed_identity() {
    tokio::time::pause();
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    assert_eq!(link.identity(), "42");
    link.emit(LinkEvent::Opened).await;
    link.emit(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    scheduled(&mut h.events).await;

    // Credential replaced while the timer is pending
    let epoch = h.store.epoch();
    assert!(h.store.apply_refresh(epoch, credentials_for("77")));

    let retry = next_link(&mut h.links).await;
    assert_eq!(retry.identity(), "77");
    assert_eq!(
        h.client.status().await.unwrap().target_identity.as_deref(),
        Some("77")
    );
}

async fn open_channel(h: &mut Harness) -> FakeLink {
    h.client.connect();
    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    wait_for(&mut h.events, |event| match event {
        LifecycleEvent::Connected { .. } => Some(()),
        _ => None,
    })
    .await;
    link
}

#[actix::test]
async fn test_rotated_token_for_same_identity_reopens_link() {
    let mut h = harness();
    let first = open_channel(&mut h).await;

    let rotated = issued_token("42", 1);
    let epoch = h.store.epoch();
    assert!(h.store.apply_refresh(
        epoch,
        Credentials {
            access_token: rotated.clone(),
            refresh_token: "refresh-42b".into(),
        }
    ));

    let second = next_link(&mut h.links).await;
    assert_eq!(second.identity(), "42");
    assert_eq!(token_param(&second.url), Some(rotated));
    assert_ne!(token_param(&second.url), token_param(&first.url));

    // The superseded link no longer drives the state
    let _ = first.events.send(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    second.emit(LinkEvent::Opened).await;
    let status = h.client.status().await.unwrap();
    assert_eq!(status.target_identity.as_deref(), Some("42"));
    assert_eq!(status.attempt, 0);
}

#[actix::test]
async fn test_new_identity_while_open_reopens_link() {
    let mut h = harness();
    let _first = open_channel(&mut h).await;

    let epoch = h.store.epoch();
    assert!(h.store.apply_refresh(epoch, credentials_for("77")));

    let second = next_link(&mut h.links).await;
    assert_eq!(second.identity(), "77");
    assert_eq!(
        h.client.status().await.unwrap().target_identity.as_deref(),
        Some("77")
    );
}

#[actix::test]
async fn test_identity_confirmation_keeps_link() {
    let mut h = harness();
    let _link = open_channel(&mut h).await;

    // Same credential, only the profile is filled in
    let epoch = h.store.epoch();
    assert!(h.store.confirm_identity(epoch, Default::default()));

    for _ in 0..5 {
        h.client.status().await.unwrap();
    }
    assert!(h.links.try_recv().is_err());
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Open);
}

#[actix::test]
async fn test_logout_lost_to_lag_still_closes() {
    let mut h = harness_on(EventBus::new(2));
    h.client.connect();
    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    for _ in 0..20 {
        if h.client.status().await.unwrap().state == ChannelState::Open {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Open);

    // Burst past the bus capacity before the actor gets to run
    h.store.logout();
    for n in 0..4 {
        h.store.bus().publish(LifecycleEvent::ChannelError { message: format!("noise {}", n) });
    }

    let mut state = ChannelState::Open;
    for _ in 0..20 {
        state = h.client.status().await.unwrap().state;
        if state == ChannelState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, ChannelState::Idle);
    assert!(h.links.try_recv().is_err());
}

#[actix::test]
async fn test_logout_closes_and_prevents_reconnect() {
    tokio::time::pause();
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    h.store.logout();

    let code = wait_for(&mut h.events, |event| match event {
        LifecycleEvent::Disconnected { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, 1000);

    // Late close from the abandoned link is ignored
    let _ = link.events.send(LinkEvent::Closed { code: 1006, reason: String::new() }).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.links.try_recv().is_err());
}

#[actix::test]
async fn test_unusable_token_skips_connect() {
    let mut h = harness();
    h.store.establish(
        Credentials {
            access_token: "opaque-token".into(),
            refresh_token: "r".into(),
        },
        None,
    );
    h.client.connect();

    let message = wait_for(&mut h.events, |event| match event {
        LifecycleEvent::ChannelError { message } => Some(message),
        _ => None,
    })
    .await;
    assert!(message.contains("identity"));
    assert!(h.links.try_recv().is_err());
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Idle);
}

#[actix::test]
async fn test_frames_reach_subscribers_in_order() {
    let mut h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    h.client.subscribe(EventKind::NewMessage, move |event| {
        sink.lock().unwrap().push(event.field("message").unwrap_or("").to_string());
    });
    let other = seen.clone();
    let status_handle = h.client.subscribe(EventKind::StatusNotification, move |_| {
        other.lock().unwrap().push("status".to_string());
    });
    h.client.unsubscribe(status_handle);
    h.client.unsubscribe(status_handle);
    h.client.connect();

    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    link.emit(LinkEvent::Frame(r#"{"type":"new_message","issue_id":3,"message":"one"}"#.into()))
        .await;
    link.emit(LinkEvent::Frame("not json".into())).await;
    link.emit(LinkEvent::Frame(r#"{"type":"notification","issue_id":3}"#.into())).await;
    link.emit(LinkEvent::Frame(r#"{"type":"new_message","issue_id":3,"message":"two"}"#.into()))
        .await;

    // Status round trip drains the mailbox behind the frames
    for _ in 0..5 {
        h.client.status().await.unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
}

#[actix::test]
async fn test_send_requires_open_channel() {
    let mut h = harness();
    assert!(matches!(
        h.client.send(&json!({ "type": "ping" })).await,
        Err(ChannelError::NotConnected)
    ));

    h.client.connect();
    let mut link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Opened).await;
    wait_for(&mut h.events, |event| match event {
        LifecycleEvent::Connected { .. } => Some(()),
        _ => None,
    })
    .await;

    h.client.send(&json!({ "type": "ping" })).await.unwrap();
    let sent = link.outbound.recv().await.unwrap();
    assert_eq!(serde_json::from_str::<serde_json::Value>(&sent).unwrap(), json!({ "type": "ping" }));
}

#[actix::test]
async fn test_attempts_run_out() {
    tokio::time::pause();
    let mut h = harness();
    h.client.connect();

    let link = next_link(&mut h.links).await;
    link.emit(LinkEvent::Failed("refused".into())).await;
    for _ in 0..3 {
        scheduled(&mut h.events).await;
        let retry = next_link(&mut h.links).await;
        retry.emit(LinkEvent::Failed("refused".into())).await;
    }

    let attempts = wait_for(&mut h.events, |event| match event {
        LifecycleEvent::ReconnectExhausted { attempts } => Some(attempts),
        _ => None,
    })
    .await;
    assert_eq!(attempts, 3);
    assert_eq!(h.client.status().await.unwrap().state, ChannelState::Idle);
}
