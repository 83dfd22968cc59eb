//! Session persistence.
//!
//! File layout: a small JSON envelope holding a base64 nonce and the
//! AES-256-GCM ciphertext of the serialized [`Credentials`]. The key is
//! SHA-256 over a fixed context string and the configured secret.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use common::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::store::Credentials;

const KEY_CONTEXT: &[u8] = b"station-viewer:session-vault:v1:";
const ENVELOPE_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

/// Where a signed-in session survives process restarts.
pub trait SessionVault: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>>;
    fn store(&self, credentials: &Credentials) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

/// Encrypted-at-rest file vault.
pub struct EncryptedFileVault {
    path: PathBuf,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptedFileVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileVault")
            .field("path", &self.path)
            .field("cipher", &"<redacted>")
            .finish()
    }
}

impl EncryptedFileVault {
    pub fn new(path: impl Into<PathBuf>, secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(Error::Config("session vault secret must not be empty".into()));
        }

        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(secret.as_bytes());
        let key = hasher.finalize();

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Vault(format!("invalid vault key: {e}")))?;

        Ok(Self {
            path: path.into(),
            cipher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Vault("session encryption failed".into()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(Envelope {
            version: ENVELOPE_VERSION,
            nonce: b64.encode(nonce),
            ciphertext: b64.encode(ciphertext),
        })
    }

    fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::Vault(format!(
                "unsupported vault version {}",
                envelope.version
            )));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce = b64
            .decode(&envelope.nonce)
            .map_err(|e| Error::Vault(format!("bad nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Vault("bad nonce length".into()));
        }
        let ciphertext = b64
            .decode(&envelope.ciphertext)
            .map_err(|e| Error::Vault(format!("bad ciphertext encoding: {e}")))?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                Error::Vault("could not decrypt session (wrong key or corrupted file)".into())
            })
    }
}

impl SessionVault for EncryptedFileVault {
    fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|e| Error::Vault(format!("malformed vault file: {e}")))?;
        let plaintext = self.decrypt(&envelope)?;
        let credentials: Credentials = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Vault(format!("malformed session payload: {e}")))?;

        debug!("Loaded persisted session from {}", self.path.display());
        Ok(Some(credentials))
    }

    fn store(&self, credentials: &Credentials) -> Result<()> {
        let plaintext = serde_json::to_vec(credentials)?;
        let envelope = self.encrypt(&plaintext)?;
        let contents = serde_json::to_string(&envelope)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write-then-rename; readers never see a partial file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Persisted session to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Process-local vault; nothing outlives the process.
#[derive(Debug, Default)]
pub struct MemoryVault {
    slot: Mutex<Option<Credentials>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Credentials>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionVault for MemoryVault {
    fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.slot().clone())
    }

    fn store(&self, credentials: &Credentials) -> Result<()> {
        *self.slot() = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}
