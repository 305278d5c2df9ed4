// realtime-client/src/transport.rs
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

/// Abnormal closure: the link dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close frame without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Default bound on the websocket handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a link reports back to its owner.
///
/// A link ends with exactly one `Closed` or `Failed`; `Failed` means the
/// handshake never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Frame(String),
    Closed { code: u16, reason: String },
    Failed(String),
}

/// Both ends of one connection attempt as seen by its owner.
///
/// Dropping `outbound` asks the link to close.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opens push-channel links
pub trait ChannelTransport: Send + Sync {
    fn open(&self, url: Url) -> Link;
}

/// `tokio-tungstenite` websocket transport
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    handshake_timeout: Duration,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// A handshake still pending after `timeout` is reported as `Failed`
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl ChannelTransport for TungsteniteTransport {
    fn open(&self, url: Url) -> Link {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(32);
        let (events_tx, events_rx) = mpsc::channel::<LinkEvent>(64);

        tokio::spawn(run_link(url, self.handshake_timeout, outbound_rx, events_tx));

        Link {
            outbound: outbound_tx,
            events: events_rx,
        }
    }
}

async fn run_link(
    url: Url,
    handshake_timeout: Duration,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<LinkEvent>,
) {
    // The token rides in the query string; keep it out of the logs
    let mut shown = url.clone();
    shown.set_query(None);

    let stream = match tokio::time::timeout(handshake_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Channel handshake with {} failed: {}", shown, e);
            let _ = events.send(LinkEvent::Failed(e.to_string())).await;
            return;
        }
        Err(_) => {
            tracing::warn!("Channel handshake with {} timed out after {:?}", shown, handshake_timeout);
            let _ = events
                .send(LinkEvent::Failed(format!("handshake timed out after {:?}", handshake_timeout)))
                .await;
            return;
        }
    };
    tracing::debug!("Channel link open to {}", shown);
    if events.send(LinkEvent::Opened).await.is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        let _ = events
                            .send(LinkEvent::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() })
                            .await;
                        break;
                    }
                }
                None => {
                    // Owner let go: close politely, nobody is listening any more
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Borrowed("client disconnect"),
                        })))
                        .await;
                    break;
                }
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if events.send(LinkEvent::Frame(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    let _ = events.send(LinkEvent::Closed { code, reason }).await;
                    break;
                }
                Some(Ok(_)) => {
                    // Binary and control frames carry nothing for subscribers
                }
                Some(Err(e)) => {
                    let _ = events
                        .send(LinkEvent::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() })
                        .await;
                    break;
                }
                None => {
                    let _ = events
                        .send(LinkEvent::Closed { code: CLOSE_ABNORMAL, reason: "stream ended".to_string() })
                        .await;
                    break;
                }
            },
        }
    }
}
