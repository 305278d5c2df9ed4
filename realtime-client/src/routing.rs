// realtime-client/src/routing.rs
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use common::InboundEvent;

use crate::error::ChannelError;

/// Build `<base>/ws/updates/<identity>?token=<token>`.
///
/// `http`/`https` bases are rewritten to `ws`/`wss`.
pub fn channel_url(base: &str, identity_id: &str, access_token: &str) -> Result<Url, ChannelError> {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };

    let mut url = Url::parse(&format!("{}/ws/updates/{}", base, identity_id))
        .map_err(|e| ChannelError::InvalidUrl(format!("{}: {}", base, e)))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ChannelError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
    }
    url.query_pairs_mut().append_pair("token", access_token);
    Ok(url)
}

/// Decode one text frame; non-JSON and non-object frames are dropped
pub fn parse_frame(text: &str, arrived_at: DateTime<Utc>) -> Option<InboundEvent> {
    match serde_json::from_str::<Value>(text) {
        Ok(payload @ Value::Object(_)) => Some(InboundEvent::from_frame(payload, arrived_at)),
        Ok(_) => {
            tracing::debug!("Dropping non-object frame");
            None
        }
        Err(e) => {
            tracing::warn!("Dropping undecodable frame: {}", e);
            None
        }
    }
}
