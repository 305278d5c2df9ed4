pub mod actors;
pub mod backoff;
pub mod chat;
pub mod client;
pub mod error;
pub mod routing;
pub mod subscribers;
pub mod transport;

pub use self::actors::channel_actor::{ChannelActor, ChannelState, ChannelStatus};
pub use self::backoff::ReconnectPolicy;
pub use self::chat::{ChatFeed, HistorySource};
pub use self::client::{ChannelClient, SubscriptionHandle};
pub use self::error::ChannelError;
pub use self::routing::{channel_url, parse_frame};
pub use self::subscribers::{Subscriber, SubscriberRegistry};
pub use self::transport::{ChannelTransport, Link, LinkEvent, TungsteniteTransport};
