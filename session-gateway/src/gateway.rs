// session-gateway/src/gateway.rs
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use common::{Credentials, LogoutReason};

use crate::error::{GatewayError, RefreshError};
use crate::token_store::TokenStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};

pub const REFRESH_PATH: &str = "/auth/refresh";

type RefreshFuture = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

// The one pending refresh every 401'd caller awaits
struct RefreshCycle {
    id: u64,
    future: RefreshFuture,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

struct GatewayInner {
    transport: Arc<dyn HttpTransport>,
    store: TokenStore,
    refresh_timeout: Duration,
    cycle: Mutex<Option<RefreshCycle>>,
    next_cycle_id: AtomicU64,
}

/// Authenticated request gateway.
///
/// Attaches the current access credential to every call, and on a 401 joins
/// (or starts) the single shared refresh cycle before retrying exactly once.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn HttpTransport>, store: TokenStore, refresh_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                store,
                refresh_timeout,
                cycle: Mutex::new(None),
                next_cycle_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.inner.transport
    }

    /// Whether a refresh cycle is currently pending
    pub fn is_refreshing(&self) -> bool {
        self.inner
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Send a request with the current bearer credential.
    ///
    /// Non-401 responses are returned as-is whatever their status.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        let request_id = Uuid::new_v4();
        let span = tracing::debug_span!(
            "api_request",
            %request_id,
            method = %request.method,
            path = %request.path
        );
        self.send_inner(request).instrument(span).await
    }

    /// Send and decode a 2xx JSON body; other statuses become [`GatewayError::Status`]
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, GatewayError> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(GatewayError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response.json()?)
    }

    async fn send_inner(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        let sent_with = self.inner.store.access_token();
        let response = self
            .inner
            .transport
            .execute(request.clone().with_bearer(sent_with.as_deref()))
            .await?;

        if !response.is_unauthorized() {
            tracing::debug!("Completed with status {}", response.status);
            return Ok(response);
        }

        // Anonymous calls (login) get the 401 back as an answer
        let Some(sent_with) = sent_with else {
            return Ok(response);
        };

        let current = self.inner.store.access_token();
        match current {
            None => {
                tracing::debug!("Session ended before the 401 was handled");
                return Err(GatewayError::Unauthorized);
            }
            Some(current) if current != sent_with => {
                tracing::debug!("Credential already replaced; retrying without a refresh");
            }
            Some(_) => {
                tracing::debug!("Unauthorized; awaiting refresh cycle");
                self.refresh().await?;
            }
        }

        // Re-read: the retry must carry whatever is current now
        let Some(retry_token) = self.inner.store.access_token() else {
            return Err(GatewayError::Unauthorized);
        };
        let retried = self
            .inner
            .transport
            .execute(request.with_bearer(Some(&retry_token)))
            .await?;

        if retried.is_unauthorized() {
            tracing::warn!("Still unauthorized after refresh; giving up");
            return Err(GatewayError::Unauthorized);
        }
        tracing::debug!("Retry completed with status {}", retried.status);
        Ok(retried)
    }

    /// Join the pending refresh cycle, or start one if none is pending
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let future = {
            let mut slot = self.inner.cycle.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(cycle) => {
                    tracing::trace!("Joining refresh cycle {}", cycle.id);
                    cycle.future.clone()
                }
                None => {
                    let id = self.inner.next_cycle_id.fetch_add(1, Ordering::Relaxed);
                    let future = run_cycle(self.inner.clone(), id, self.inner.store.epoch())
                        .boxed()
                        .shared();
                    *slot = Some(RefreshCycle {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }
}

async fn run_cycle(inner: Arc<GatewayInner>, id: u64, epoch: u64) -> Result<(), RefreshError> {
    tracing::info!("Starting refresh cycle {}", id);

    let outcome = match inner.store.refresh_token().filter(|token| !token.is_empty()) {
        None => Err(RefreshError::MissingRefreshToken),
        Some(refresh_token) => {
            match tokio::time::timeout(
                inner.refresh_timeout,
                request_refresh(inner.transport.as_ref(), &refresh_token),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(RefreshError::TimedOut(inner.refresh_timeout)),
            }
        }
    };

    let result = match outcome {
        Ok(credentials) => {
            if inner.store.apply_refresh(epoch, credentials) {
                Ok(())
            } else {
                Err(RefreshError::Discarded)
            }
        }
        Err(e) if e.is_terminal() => {
            tracing::warn!("Refresh cycle {} failed terminally: {}", id, e);
            inner.store.expire(epoch, LogoutReason::RefreshRejected);
            Err(e)
        }
        Err(e) => {
            tracing::warn!("Refresh cycle {} failed, session kept: {}", id, e);
            Err(e)
        }
    };

    let mut slot = inner.cycle.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().map(|cycle| cycle.id) == Some(id) {
        *slot = None;
    }
    result
}

async fn request_refresh(transport: &dyn HttpTransport, refresh_token: &str) -> Result<Credentials, RefreshError> {
    let request = ApiRequest::post(REFRESH_PATH)
        .with_json(&RefreshRequest { refresh_token })
        .map_err(|e| RefreshError::Malformed(e.to_string()))?;

    let response = transport
        .execute(request)
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.is_success() {
        return Err(RefreshError::Rejected(response.status));
    }

    let body: RefreshResponse = response
        .json()
        .map_err(|e| RefreshError::Malformed(e.to_string()))?;
    if body.access_token.is_empty() {
        return Err(RefreshError::Malformed("empty access token".to_string()));
    }

    Ok(Credentials {
        access_token: body.access_token,
        // Servers that do not rotate the refresh credential omit it
        refresh_token: body.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::mirror::MemoryCredentialMirror;
    use async_trait::async_trait;
    use common::EventBus;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Answers 401 to any bearer other than `accepted`; refresh hands out `issued`
    struct ScriptedTransport {
        accepted: String,
        issued: String,
        refresh_status: u16,
        refresh_calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedTransport {
        fn new(valid: &str, refresh_status: u16) -> Self {
            Self {
                accepted: valid.to_string(),
                issued: valid.to_string(),
                refresh_status,
                refresh_calls: AtomicUsize::new(0),
                gate: None,
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            // Every exchange suspends once, like a real round trip
            tokio::task::yield_now().await;

            if request.path == REFRESH_PATH {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                let body = serde_json::json!({ "access_token": self.issued, "refresh_token": "r2" });
                return Ok(ApiResponse::new(self.refresh_status, body.to_string()));
            }
            if request.bearer() == Some(self.accepted.as_str()) {
                Ok(ApiResponse::new(200, r#"{"ok":true}"#))
            } else {
                Ok(ApiResponse::new(401, ""))
            }
        }
    }

    fn logged_in(transport: Arc<ScriptedTransport>) -> (Gateway, Arc<MemoryCredentialMirror>) {
        let mirror = Arc::new(MemoryCredentialMirror::new());
        let store = TokenStore::new(mirror.clone(), EventBus::default());
        store.establish(
            Credentials {
                access_token: "stale".into(),
                refresh_token: "r1".into(),
            },
            None,
        );
        (Gateway::new(transport, store, Duration::from_secs(5)), mirror)
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let transport = Arc::new(ScriptedTransport::new("fresh", 200));
        let (gateway, mirror) = logged_in(transport.clone());

        let (a, b, c) = tokio::join!(
            gateway.send(ApiRequest::get("/a")),
            gateway.send(ApiRequest::get("/b")),
            gateway.send(ApiRequest::get("/c")),
        );

        assert_eq!(a.unwrap().status, 200);
        assert_eq!(b.unwrap().status, 200);
        assert_eq!(c.unwrap().status, 200);
        assert_eq!(transport.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mirror.snapshot().unwrap().refresh_token, "r2");
        assert!(!gateway.is_refreshing());
    }

    #[tokio::test]
    async fn test_rejected_refresh_logs_out() {
        let transport = Arc::new(ScriptedTransport::new("fresh", 403));
        let (gateway, mirror) = logged_in(transport);

        let err = gateway.send(ApiRequest::get("/a")).await.unwrap_err();

        assert!(matches!(err, GatewayError::SessionExpired(RefreshError::Rejected(403))));
        assert!(!gateway.store().is_authenticated());
        assert_eq!(mirror.snapshot(), None);
    }

    #[tokio::test]
    async fn test_second_401_is_terminal_for_the_request() {
        // Refresh succeeds but hands out a credential the API still refuses
        let mut scripted = ScriptedTransport::new("never-issued", 200);
        scripted.issued = "fresh".to_string();
        let transport = Arc::new(scripted);
        let (gateway, _mirror) = logged_in(transport.clone());

        let err = gateway.send(ApiRequest::get("/a")).await.unwrap_err();

        assert!(matches!(err, GatewayError::Unauthorized));
        assert_eq!(transport.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.store().access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_is_not_undone() {
        let gate = Arc::new(Notify::new());
        let mut scripted = ScriptedTransport::new("fresh", 200);
        scripted.gate = Some(gate.clone());
        let (gateway, mirror) = logged_in(Arc::new(scripted));

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.send(ApiRequest::get("/a")).await }
        });
        while !gateway.is_refreshing() {
            tokio::task::yield_now().await;
        }
        // Let the request reach the gate before logging out
        tokio::task::yield_now().await;

        gateway.store().logout();
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
        assert!(!gateway.store().is_authenticated());
        assert_eq!(mirror.snapshot(), None);
    }

    #[tokio::test]
    async fn test_refresh_from_previous_login_does_not_overwrite_new_one() {
        let gate = Arc::new(Notify::new());
        let mut scripted = ScriptedTransport::new("userA-refreshed", 200);
        scripted.gate = Some(gate.clone());
        let (gateway, mirror) = logged_in(Arc::new(scripted));

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.send(ApiRequest::get("/a")).await }
        });
        while !gateway.is_refreshing() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        let user_b = Credentials {
            access_token: "userB".into(),
            refresh_token: "rB".into(),
        };
        gateway.store().establish(user_b.clone(), None);
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
        assert_eq!(gateway.store().access_token().as_deref(), Some("userB"));
        assert_eq!(mirror.snapshot(), Some(user_b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_refresh_hits_the_ceiling_without_logout() {
        let gate = Arc::new(Notify::new());
        let mut scripted = ScriptedTransport::new("fresh", 200);
        scripted.gate = Some(gate);
        let mirror = Arc::new(MemoryCredentialMirror::new());
        let store = TokenStore::new(mirror, EventBus::default());
        store.establish(
            Credentials {
                access_token: "stale".into(),
                refresh_token: "r1".into(),
            },
            None,
        );
        let gateway = Gateway::new(Arc::new(scripted), store, Duration::from_secs(2));

        let err = gateway.send(ApiRequest::get("/a")).await.unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(gateway.store().is_authenticated());
    }

    #[tokio::test]
    async fn test_anonymous_401_is_returned_to_caller() {
        let transport = Arc::new(ScriptedTransport::new("fresh", 200));
        let store = TokenStore::new(Arc::new(MemoryCredentialMirror::new()), EventBus::default());
        let gateway = Gateway::new(transport.clone(), store, Duration::from_secs(5));

        let response = gateway.send(ApiRequest::post("/auth/login")).await.unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(transport.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_json_maps_error_status() {
        struct Missing;
        #[async_trait]
        impl HttpTransport for Missing {
            async fn execute(&self, _request: ApiRequest) -> Result<ApiResponse, TransportError> {
                Ok(ApiResponse::new(404, "gone"))
            }
        }
        let store = TokenStore::new(Arc::new(MemoryCredentialMirror::new()), EventBus::default());
        let gateway = Gateway::new(Arc::new(Missing), store, Duration::from_secs(5));

        let err = gateway
            .send_json::<serde_json::Value>(ApiRequest::get("/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 404, .. }));
    }
}
