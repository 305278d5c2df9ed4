// Common Crate - utils.rs
// common/src/utils.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Setup tracing for consistent logging across the session layer.
///
/// Unknown levels fall back to INFO; a second call keeps the first subscriber.
pub fn setup_tracing(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

// Claims we read from an access credential. Only `sub` matters here; the
// server owns verification, so the signature is not checked client-side.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(default)]
    pub sub: Option<Value>,
    #[serde(default)]
    pub exp: Option<u64>,
}

/// Derive the channel identity from the subject claim of an access credential.
///
/// Only the middle segment is read, so the header's algorithm does not
/// matter. Returns `None` for anything that is not three dot-separated
/// segments with a decodable claim set carrying a string or numeric subject.
pub fn identity_from_token(token: &str) -> Option<String> {
    let segments: Vec<&str> = token.split('.').collect();
    let [_, claims, _] = segments.as_slice() else {
        return None;
    };

    let raw = base64::decode_config(claims.trim_end_matches('='), base64::URL_SAFE_NO_PAD)
        .map_err(|e| tracing::debug!("Access credential claims not base64url: {}", e))
        .ok()?;
    let claims: AccessClaims = serde_json::from_slice(&raw)
        .map_err(|e| tracing::debug!("Access credential claims not decodable: {}", e))
        .ok()?;

    match claims.sub? {
        Value::String(sub) if !sub.trim().is_empty() => Some(sub.trim().to_string()),
        Value::Number(sub) => Some(sub.to_string()),
        _ => None,
    }
}
