pub mod messages;
pub mod config;
pub mod models;
pub mod utils;

pub use self::messages::*;
pub use self::config::*;
pub use self::models::chat::{derived_id, ChatMessage, MessageOrigin};
pub use self::models::inbound::{parse_timestamp, EventKind, InboundEvent};
pub use self::models::session::{Credentials, LoginResponse, Profile, Session};
pub use self::utils::*;
