// common/src/models/session.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Access/refresh credential pair as returned by the login and refresh endpoints
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
}

// Tokens never end up in logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token_len", &self.access_token.len())
            .field("refresh_token_len", &self.refresh_token.len())
            .finish()
    }
}

/// User profile confirmed by a successful identity fetch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default, alias = "phoneNumber")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Fields the session layer does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body returned by `/auth/login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default, alias = "user")]
    pub profile: Option<Profile>,
}

/// The authoritative credential state.
///
/// `authenticated` is derived: it holds exactly when an access credential is
/// present. `identity` may lag behind until the identity fetch confirms it.
#[derive(Clone, Default, PartialEq)]
pub struct Session {
    access_token: Option<String>,
    refresh_token: Option<String>,
    identity: Option<Profile>,
}

impl Session {
    /// Empty session, as created at process start
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials, identity: Option<Profile>) -> Self {
        Self {
            access_token: Some(credentials.access_token),
            refresh_token: Some(credentials.refresh_token),
            identity,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn identity(&self) -> Option<&Profile> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// Replace the credential pair, keeping the confirmed identity
    pub fn replace_credentials(&mut self, credentials: Credentials) {
        self.access_token = Some(credentials.access_token);
        self.refresh_token = Some(credentials.refresh_token);
    }

    pub fn confirm_identity(&mut self, identity: Profile) {
        self.identity = Some(identity);
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.access_token, &self.refresh_token) {
            (Some(access), Some(refresh)) => Some(Credentials {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
            }),
            (Some(access), None) => Some(Credentials {
                access_token: access.clone(),
                refresh_token: String::new(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("authenticated", &self.is_authenticated())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("identity", &self.identity)
            .finish()
    }
}
