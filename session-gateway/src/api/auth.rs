// session-gateway/src/api/auth.rs
use serde::Serialize;
use std::sync::Arc;

use common::{LoginResponse, LogoutReason, Profile};

use crate::codec::CredentialCodec;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::transport::ApiRequest;

pub const LOGIN_PATH: &str = "/auth/login";
pub const PROFILE_PATH: &str = "/users/me";

// Plaintext object sealed for each login field
#[derive(Serialize)]
struct SecretEnvelope<'a> {
    secret: &'a str,
}

#[derive(Serialize)]
struct LoginRequest {
    identifier: String,
    secret: String,
}

/// Login, startup restore and logout on top of the gateway
#[derive(Clone)]
pub struct AuthClient {
    gateway: Gateway,
    codec: Arc<CredentialCodec>,
}

impl AuthClient {
    pub fn new(gateway: Gateway, codec: Arc<CredentialCodec>) -> Self {
        Self { gateway, codec }
    }

    /// Exchange an identifier/secret pair for a session.
    ///
    /// Both fields are sealed with the credential codec. The call goes
    /// straight to the transport: it carries no bearer and a 401 here means
    /// bad credentials, not an expired session.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Option<Profile>, GatewayError> {
        let body = LoginRequest {
            identifier: self.codec.seal(&SecretEnvelope { secret: identifier })?,
            secret: self.codec.seal(&SecretEnvelope { secret })?,
        };

        let response = self
            .gateway
            .transport()
            .execute(ApiRequest::post(LOGIN_PATH).with_json(&body)?)
            .await?;
        if !response.is_success() {
            tracing::info!("Login refused with status {}", response.status);
            return Err(GatewayError::Status {
                status: response.status,
                body: response.body,
            });
        }
        let login: LoginResponse = response.json()?;

        let store = self.gateway.store();
        if let Some(profile) = login.profile {
            store.establish(login.credentials, Some(profile.clone()));
            return Ok(Some(profile));
        }

        store.establish(login.credentials, None);
        let epoch = store.epoch();
        match self.fetch_identity().await {
            Ok(profile) => {
                store.confirm_identity(epoch, profile.clone());
                Ok(Some(profile))
            }
            Err(e) => {
                tracing::warn!("Logged in but identity fetch failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Hydrate from the credential mirror and confirm the identity.
    ///
    /// `Ok(None)` when there was nothing to restore or the backend rejected
    /// the stored credential. Transport failures keep the hydrated session.
    pub async fn restore(&self) -> Result<Option<Profile>, GatewayError> {
        let store = self.gateway.store();
        if !store.hydrate() {
            return Ok(None);
        }
        let epoch = store.epoch();

        match self.fetch_identity().await {
            Ok(profile) => {
                store.confirm_identity(epoch, profile.clone());
                Ok(Some(profile))
            }
            Err(GatewayError::Unauthorized) | Err(GatewayError::Status { status: 401 | 403, .. }) => {
                store.expire(epoch, LogoutReason::IdentityRejected);
                Ok(None)
            }
            Err(GatewayError::SessionExpired(e)) => {
                tracing::info!("Stored session could not be refreshed: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_identity(&self) -> Result<Profile, GatewayError> {
        self.gateway.send_json(ApiRequest::get(PROFILE_PATH)).await
    }

    pub fn logout(&self) {
        self.gateway.store().logout();
    }
}
