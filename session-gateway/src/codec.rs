// session-gateway/src/codec.rs
//! Client-side encryption of credential payloads.
//!
//! Secrets are serialized to JSON and sealed with AES-256-GCM under a key
//! provisioned from the backend's `/encryption/config` endpoint. The wire form
//! is `base64(nonce || ciphertext)`; the server splits at [`NONCE_LEN`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{PoisonError, RwLock};

use crate::error::CodecError;
use crate::transport::{ApiRequest, HttpTransport};

/// AES-GCM nonce length (12 bytes)
pub const NONCE_LEN: usize = 12;

/// AES-256 key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// Seed hashed into the fallback key when provisioning fails
pub const FALLBACK_KEY_SEED: &str = "set-a-strong-shared-key-here";

/// Associated data paired with the fallback key
pub const FALLBACK_ASSOCIATED_DATA: &str = "civic-portal-credentials";

const CONFIG_PATH: &str = "/encryption/config";

/// Nonce and ciphertext (with GCM tag) of one sealed secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    pub fn pack(&self) -> String {
        pack(&self.nonce, &self.ciphertext)
    }
}

/// Key material as served by the configuration endpoint
#[derive(Debug, Deserialize)]
struct EncryptionConfig {
    #[serde(rename = "keyMaterial", alias = "key_b64")]
    key_material: String,
    #[serde(rename = "associatedData", alias = "aad", default)]
    associated_data: String,
}

struct KeyState {
    cipher: Aes256Gcm,
    associated_data: String,
    degraded: bool,
}

/// Symmetric credential codec.
///
/// Starts unconfigured. A failed [`configure`](Self::configure) leaves it
/// unconfigured, and [`encrypt`](Self::encrypt) refuses to run until a valid
/// key is installed.
pub struct CredentialCodec {
    state: RwLock<Option<KeyState>>,
}

impl Default for CredentialCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("configured", &self.is_configured())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl CredentialCodec {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    /// Install a 32-byte key and the associated data bound into every ciphertext
    pub fn configure(&self, key_material: &[u8], associated_data: &str) -> Result<(), CodecError> {
        self.install(key_material, associated_data, false)
    }

    /// Same as [`configure`](Self::configure) with base64 key material
    pub fn configure_b64(&self, key_b64: &str, associated_data: &str) -> Result<(), CodecError> {
        match base64::decode(key_b64.trim()) {
            Ok(key) => self.configure(&key, associated_data),
            Err(e) => {
                self.clear();
                Err(CodecError::InvalidKeyEncoding(e))
            }
        }
    }

    /// Install the hash-derived fallback key.
    ///
    /// The fallback key is the same for every client; ciphertexts sealed under
    /// it are only obfuscated, not confidential.
    pub fn configure_fallback(&self) {
        let key = fallback_key();
        tracing::warn!(
            "Credential codec degraded: using shared fallback key (fingerprint {})",
            fingerprint(&key)
        );
        if let Err(e) = self.install(&key, FALLBACK_ASSOCIATED_DATA, true) {
            // Unreachable with a SHA-256 sized key
            tracing::error!("Failed to install fallback key: {}", e);
        }
    }

    /// Fetch key material from the backend once; degrade to the fallback key
    /// on any failure. Returns `true` when the server key was installed.
    pub async fn provision(&self, transport: &dyn HttpTransport) -> bool {
        let fetched = match transport.execute(ApiRequest::get(CONFIG_PATH)).await {
            Ok(response) if response.is_success() => response
                .json::<EncryptionConfig>()
                .map_err(|e| format!("malformed encryption config: {}", e)),
            Ok(response) => Err(format!("encryption config returned status {}", response.status)),
            Err(e) => Err(e.to_string()),
        };

        let installed = fetched.and_then(|cfg| {
            self.configure_b64(&cfg.key_material, &cfg.associated_data)
                .map_err(|e| e.to_string())
        });

        match installed {
            Ok(()) => {
                tracing::info!("Credential codec provisioned from {}", CONFIG_PATH);
                true
            },
            Err(reason) => {
                tracing::warn!("Encryption config unavailable ({}), falling back", reason);
                self.configure_fallback();
                false
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.read_state(|state| state.is_some())
    }

    /// Whether the active key is the shared fallback key
    pub fn is_degraded(&self) -> bool {
        self.read_state(|state| state.as_ref().map(|s| s.degraded).unwrap_or(false))
    }

    /// Serialize `secret` and seal it under a fresh random nonce
    pub fn encrypt<T: Serialize + ?Sized>(&self, secret: &T) -> Result<Sealed, CodecError> {
        let plaintext = serde_json::to_vec(secret)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self.read_state(|state| -> Result<Vec<u8>, CodecError> {
            let state = state.as_ref().ok_or(CodecError::NotConfigured)?;
            state
                .cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &plaintext,
                        aad: state.associated_data.as_bytes(),
                    },
                )
                .map_err(|_| CodecError::Encrypt)
        })?;

        Ok(Sealed { nonce, ciphertext })
    }

    /// Encrypt and pack in one step; this is what goes on the wire
    pub fn seal<T: Serialize + ?Sized>(&self, secret: &T) -> Result<String, CodecError> {
        Ok(self.encrypt(secret)?.pack())
    }

    /// Reverse of [`encrypt`](Self::encrypt) under the installed key
    pub fn decrypt<T: DeserializeOwned>(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<T, CodecError> {
        if nonce.len() != NONCE_LEN {
            return Err(CodecError::MalformedBlob(format!("nonce must be {} bytes", NONCE_LEN)));
        }

        let plaintext = self.read_state(|state| -> Result<Vec<u8>, CodecError> {
            let state = state.as_ref().ok_or(CodecError::NotConfigured)?;
            state
                .cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: state.associated_data.as_bytes(),
                    },
                )
                .map_err(|_| CodecError::Decrypt)
        })?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn install(&self, key_material: &[u8], associated_data: &str, degraded: bool) -> Result<(), CodecError> {
        if key_material.len() != KEY_LEN {
            tracing::error!(
                "Rejecting encryption key of {} bytes; codec disabled until reconfigured",
                key_material.len()
            );
            self.clear();
            return Err(CodecError::InvalidKeyLength(key_material.len()));
        }

        let cipher = Aes256Gcm::new_from_slice(key_material)
            .map_err(|_| CodecError::InvalidKeyLength(key_material.len()))?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = Some(KeyState {
            cipher,
            associated_data: associated_data.to_string(),
            degraded,
        });
        Ok(())
    }

    fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = None;
    }

    fn read_state<R>(&self, f: impl FnOnce(&Option<KeyState>) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}

/// Concatenate nonce and ciphertext and encode as one transportable string
pub fn pack(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> String {
    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(nonce);
    packed.extend_from_slice(ciphertext);
    base64::encode(packed)
}

/// Split a packed blob at the fixed nonce length
pub fn unpack(blob: &str) -> Result<([u8; NONCE_LEN], Vec<u8>), CodecError> {
    let raw = base64::decode(blob.trim()).map_err(|e| CodecError::MalformedBlob(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(CodecError::MalformedBlob(format!(
            "expected at least {} bytes, got {}",
            NONCE_LEN,
            raw.len()
        )));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[..NONCE_LEN]);
    Ok((nonce, raw[NONCE_LEN..].to_vec()))
}

fn fallback_key() -> Vec<u8> {
    Sha256::digest(FALLBACK_KEY_SEED.as_bytes()).to_vec()
}

/// Short, non-reversible identifier of a key for logs
fn fingerprint(key: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(key));
    digest[..8].to_string()
}
