pub mod api;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod mirror;
pub mod token_store;
pub mod transport;

pub use self::api::{AuthClient, MessagesApi, SendReceipt};
pub use self::codec::{pack, unpack, CredentialCodec, Sealed};
pub use self::error::{CodecError, GatewayError, MirrorError, RefreshError, TransportError};
pub use self::gateway::Gateway;
pub use self::mirror::{CredentialMirror, FileCredentialMirror, MemoryCredentialMirror};
pub use self::token_store::TokenStore;
pub use self::transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
