// session-gateway/src/token_store.rs
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use common::{Credentials, EventBus, LifecycleEvent, LogoutReason, Profile, Session};

use crate::mirror::CredentialMirror;

struct StoreState {
    session: Session,
    /// Bumped whenever the session is torn down; work started under an older
    /// epoch may not write credentials back.
    epoch: u64,
}

struct StoreInner {
    state: RwLock<StoreState>,
    mirror: Arc<dyn CredentialMirror>,
    bus: EventBus,
}

/// Single owner of the [`Session`].
///
/// Every other component reads through a clone of this handle and re-reads
/// after each suspension point instead of caching tokens.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("session", &self.snapshot())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl TokenStore {
    pub fn new(mirror: Arc<dyn CredentialMirror>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState {
                    session: Session::anonymous(),
                    epoch: 0,
                }),
                mirror,
                bus,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn snapshot(&self) -> Session {
        self.read(|state| state.session.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|state| state.session.access_token().map(str::to_string))
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(|state| state.session.refresh_token().map(str::to_string))
    }

    pub fn identity(&self) -> Option<Profile> {
        self.read(|state| state.session.identity().cloned())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.session.is_authenticated())
    }

    pub fn epoch(&self) -> u64 {
        self.read(|state| state.epoch)
    }

    /// Load the mirrored credential pair once at startup.
    ///
    /// The identity stays unconfirmed; returns whether a credential was found.
    pub fn hydrate(&self) -> bool {
        let stored = match self.inner.mirror.load() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Ignoring unreadable credential mirror: {}", e);
                None
            }
        };

        let Some(credentials) = stored else {
            tracing::debug!("No mirrored credentials to hydrate");
            return false;
        };

        let mut state = self.write();
        state.session = Session::with_credentials(credentials, None);
        state.epoch += 1;
        tracing::info!("Session hydrated from credential mirror");
        true
    }

    /// Install a fresh credential pair after a successful login.
    ///
    /// Starts a new epoch: refresh work begun under the previous session can
    /// no longer write back.
    pub fn establish(&self, credentials: Credentials, identity: Option<Profile>) {
        {
            let mut state = self.write();
            self.mirror_save(&credentials);
            state.session = Session::with_credentials(credentials, identity.clone());
            state.epoch += 1;
        }
        tracing::info!("Session established");
        self.inner.bus.publish(LifecycleEvent::Authenticated { identity });
    }

    /// Record the profile returned by a successful identity fetch
    pub fn confirm_identity(&self, epoch: u64, identity: Profile) -> bool {
        {
            let mut state = self.write();
            if state.epoch != epoch || !state.session.is_authenticated() {
                tracing::debug!("Dropping identity confirmation for an ended session");
                return false;
            }
            state.session.confirm_identity(identity.clone());
        }
        self.inner.bus.publish(LifecycleEvent::Authenticated {
            identity: Some(identity),
        });
        true
    }

    /// Replace the credential pair with the result of a refresh cycle.
    ///
    /// Discarded (returns `false`) if the session ended after `epoch` was read.
    pub fn apply_refresh(&self, epoch: u64, credentials: Credentials) -> bool {
        {
            let mut state = self.write();
            if state.epoch != epoch || !state.session.is_authenticated() {
                tracing::info!("Discarding refresh result: session ended while it was in flight");
                return false;
            }
            self.mirror_save(&credentials);
            state.session.replace_credentials(credentials);
        }
        tracing::info!("Access credential refreshed");
        self.inner.bus.publish(LifecycleEvent::CredentialsRefreshed);
        true
    }

    /// Explicit logout; valid in any state
    pub fn logout(&self) {
        let was_authenticated = {
            let mut state = self.write();
            let was_authenticated = state.session.is_authenticated();
            self.teardown(&mut state);
            was_authenticated
        };

        if was_authenticated {
            tracing::info!("Session logged out");
            self.inner.bus.publish(LifecycleEvent::LoggedOut {
                reason: LogoutReason::UserRequested,
            });
        }
    }

    /// Terminal failure of the session started under `epoch`.
    ///
    /// A no-op if the session already ended, so one teardown emits one event.
    pub fn expire(&self, epoch: u64, reason: LogoutReason) -> bool {
        {
            let mut state = self.write();
            if state.epoch != epoch || !state.session.is_authenticated() {
                return false;
            }
            self.teardown(&mut state);
        }
        tracing::warn!("Session expired: {:?}", reason);
        self.inner.bus.publish(LifecycleEvent::LoggedOut { reason });
        true
    }

    fn teardown(&self, state: &mut StoreState) {
        state.session = Session::anonymous();
        state.epoch += 1;
        if let Err(e) = self.inner.mirror.clear() {
            tracing::error!("Failed to erase credential mirror: {}", e);
        }
    }

    fn mirror_save(&self, credentials: &Credentials) {
        if let Err(e) = self.inner.mirror.save(credentials) {
            tracing::error!("Failed to mirror credentials: {}", e);
        }
    }

    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
