// session-gateway/src/error.rs
use thiserror::Error;

/// Credential codec failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encryption key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),
    #[error("codec has no usable key; reconfigure before encrypting")]
    NotConfigured,
    #[error("failed to serialize secret: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("encryption primitive failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("packed blob is malformed: {0}")]
    MalformedBlob(String),
}

/// Durable credential mirror failures
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("credential mirror I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential mirror is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Network-level failures of a single HTTP exchange
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.to_string())
    }
}

/// Outcome of a failed refresh cycle, shared by every caller waiting on it
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("no refresh credential available")]
    MissingRefreshToken,
    #[error("refresh rejected with status {0}")]
    Rejected(u16),
    #[error("refresh response was not understood: {0}")]
    Malformed(String),
    #[error("refresh transport failure: {0}")]
    Transport(String),
    #[error("refresh exceeded {0:?}")]
    TimedOut(std::time::Duration),
    #[error("session ended while the refresh was in flight")]
    Discarded,
}

impl RefreshError {
    /// Whether this failure ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshError::MissingRefreshToken | RefreshError::Rejected(_) | RefreshError::Malformed(_)
        )
    }
}

/// Errors surfaced by the authenticated request gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Still unauthorized after one refresh and one retry
    #[error("request unauthorized after refresh")]
    Unauthorized,
    #[error("session expired: {0}")]
    SessionExpired(RefreshError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<RefreshError> for GatewayError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Transport(msg) => GatewayError::Transport(TransportError::Request(msg)),
            RefreshError::TimedOut(after) => {
                GatewayError::Transport(TransportError::Request(format!("refresh timed out after {:?}", after)))
            },
            RefreshError::Discarded => GatewayError::Unauthorized,
            terminal => GatewayError::SessionExpired(terminal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rejections_are_terminal() {
        assert!(RefreshError::Rejected(401).is_terminal());
        assert!(RefreshError::MissingRefreshToken.is_terminal());
        assert!(!RefreshError::Transport("reset".into()).is_terminal());
        assert!(!RefreshError::TimedOut(std::time::Duration::from_secs(1)).is_terminal());
    }

    #[test]
    fn test_refresh_errors_map_to_gateway_errors() {
        assert!(matches!(
            GatewayError::from(RefreshError::Rejected(403)),
            GatewayError::SessionExpired(RefreshError::Rejected(403))
        ));
        assert!(matches!(GatewayError::from(RefreshError::Discarded), GatewayError::Unauthorized));
        assert!(matches!(
            GatewayError::from(RefreshError::Transport("down".into())),
            GatewayError::Transport(_)
        ));
    }
}
