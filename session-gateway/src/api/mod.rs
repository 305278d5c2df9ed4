// session-gateway/src/api/mod.rs
pub mod auth;
pub mod messages;

pub use auth::AuthClient;
pub use messages::{MessagesApi, SendReceipt};
