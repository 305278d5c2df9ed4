// realtime-client/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid channel address: {0}")]
    InvalidUrl(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("channel actor unavailable: {0}")]
    Mailbox(#[from] actix::MailboxError),
}
