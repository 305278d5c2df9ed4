// session-gateway/src/mirror.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use common::Credentials;

use crate::error::MirrorError;

/// Durable client-local copy of the credential pair.
///
/// Writes are synchronous so the mirror never lags the in-memory session.
pub trait CredentialMirror: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>, MirrorError>;
    fn save(&self, credentials: &Credentials) -> Result<(), MirrorError>;
    fn clear(&self) -> Result<(), MirrorError>;
}

// On-disk layout: two string entries under fixed keys
#[derive(Debug, Serialize, Deserialize)]
struct MirrorEntries {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
}

/// JSON file mirror
#[derive(Debug, Clone)]
pub struct FileCredentialMirror {
    path: PathBuf,
}

impl FileCredentialMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialMirror for FileCredentialMirror {
    fn load(&self) -> Result<Option<Credentials>, MirrorError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entries: MirrorEntries = serde_json::from_str(&raw)?;
        Ok(match entries.access_token {
            Some(access_token) if !access_token.is_empty() => Some(Credentials {
                access_token,
                refresh_token: entries.refresh_token.unwrap_or_default(),
            }),
            _ => None,
        })
    }

    fn save(&self, credentials: &Credentials) -> Result<(), MirrorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = MirrorEntries {
            access_token: Some(credentials.access_token.clone()),
            refresh_token: Some(credentials.refresh_token.clone()),
        };

        // Write beside the target, then swap in
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), MirrorError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local mirror for tests and embedders without a filesystem
#[derive(Debug, Default)]
pub struct MemoryCredentialMirror {
    slot: Mutex<Option<Credentials>>,
}

impl MemoryCredentialMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
        }
    }

    pub fn snapshot(&self) -> Option<Credentials> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CredentialMirror for MemoryCredentialMirror {
    fn load(&self) -> Result<Option<Credentials>, MirrorError> {
        Ok(self.snapshot())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), MirrorError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), MirrorError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
