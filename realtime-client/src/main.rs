// realtime-client/src/main.rs
// portal-session: keeps a civic portal session and its push channel alive

use std::env;
use std::sync::Arc;

use common::{setup_tracing, Config, EventKind, LifecycleEvent};
use realtime_client::{ChannelClient, ChatFeed, ReconnectPolicy, TungsteniteTransport};
use session_gateway::{
    AuthClient, CredentialCodec, FileCredentialMirror, Gateway, MessagesApi, ReqwestTransport, TokenStore,
};

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Setup tracing
    setup_tracing(&config.log_level);
    tracing::info!("API at {}, channel at {}", config.api_base_url, config.channel_base_url);

    let transport = Arc::new(ReqwestTransport::new(&config.api_base_url, config.request_timeout())?);

    let codec = Arc::new(CredentialCodec::new());
    if !codec.provision(transport.as_ref()).await {
        tracing::warn!("Login secrets will be sealed with the shared fallback key");
    }

    let bus = common::EventBus::default();
    let mirror = Arc::new(FileCredentialMirror::new(&config.credential_store_path));
    let store = TokenStore::new(mirror, bus.clone());
    let gateway = Gateway::new(transport.clone(), store.clone(), config.refresh_timeout());
    let auth = AuthClient::new(gateway.clone(), codec);
    let messages = MessagesApi::new(gateway);

    // Log every lifecycle event
    let mut lifecycle = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                LifecycleEvent::LoggedOut { reason } => tracing::warn!("Logged out: {:?}", reason),
                other => tracing::info!("{:?}", other),
            }
        }
    });

    match auth.restore().await {
        Ok(Some(profile)) => tracing::info!("Restored session for user {:?}", profile.id),
        Ok(None) => tracing::info!("No stored session"),
        Err(e) => tracing::warn!("Could not confirm stored session: {}", e),
    }

    if !store.is_authenticated() {
        match (env::var("PORTAL_IDENTIFIER"), env::var("PORTAL_SECRET")) {
            (Ok(identifier), Ok(secret)) => {
                let profile = auth.login(&identifier, &secret).await?;
                tracing::info!("Logged in as {:?}", profile.and_then(|p| p.full_name));
            }
            _ => tracing::info!("Set PORTAL_IDENTIFIER and PORTAL_SECRET to log in"),
        }
    }

    // Conversations to follow, e.g. PORTAL_ISSUES=12,15
    let feed = ChatFeed::new();
    for issue_id in env::var("PORTAL_ISSUES").unwrap_or_default().split(',') {
        let issue_id = issue_id.trim();
        if !issue_id.is_empty() {
            feed.track(issue_id);
        }
    }
    if store.is_authenticated() {
        feed.resync(&messages).await;
    }
    let resync = feed.spawn_resync(&bus, Arc::new(messages));

    let client = ChannelClient::start(
        config.channel_base_url.clone(),
        ReconnectPolicy::from(&config.channel),
        store,
        Arc::new(TungsteniteTransport::new().with_handshake_timeout(config.channel.handshake_timeout())),
    );
    client.subscribe_with(EventKind::NewMessage, feed.subscriber());
    client.subscribe(EventKind::NewMessage, |event| {
        tracing::info!(
            "[issue {}] {}",
            event.issue_id.as_deref().unwrap_or("?"),
            event.field("message").unwrap_or("")
        );
    });
    client.subscribe(EventKind::StatusNotification, |event| {
        tracing::info!("Status update: {}", event.payload);
    });
    client.connect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    client.stop();
    resync.abort();
    Ok(())
}
