//! Per-identity keyring: one sealed age identity per filesystem id
//!
//! Layout: `{keyring_dir}/{filesystem_id}.json`, written once via temp file
//! + no-clobber rename. Records are never rewritten, so concurrent readers
//! need no locking; creation is serialized per filesystem id.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sdv_core::config::KeyConfig;
use sdv_core::{FilesystemId, VaultError, VaultResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::codename::{validate_codename, Pepper, StretchCost};
use crate::envelope::{self, RecipientKey};
use crate::seal::{self, derive_subkey, SealKey};

const RECORD_VERSION: u32 = 1;
const SEAL_DOMAIN: &[u8] = b"sdvault-identity-seal";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    version: u32,
    filesystem_id: FilesystemId,
    public_key: RecipientKey,
    /// base64 of the sealed `AGE-SECRET-KEY-1...` string
    sealed_identity: String,
    created_at: u64,
}

/// Filesystem-backed keyring for source identities.
pub struct KeyStore {
    keyring_dir: PathBuf,
    key_pepper: Pepper,
    creation_locks: Mutex<HashMap<FilesystemId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("keyring_dir", &self.keyring_dir)
            .field("key_pepper", &self.key_pepper)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Open (creating if needed) the keyring directory.
    pub fn open(keyring_dir: &Path, key_pepper: Pepper) -> VaultResult<Self> {
        std::fs::create_dir_all(keyring_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(keyring_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            keyring_dir: keyring_dir.to_path_buf(),
            key_pepper,
            creation_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &KeyConfig) -> VaultResult<Self> {
        Self::open(
            &config.keyring_dir,
            Pepper::new(config.key_pepper.as_bytes(), StretchCost::from(config)),
        )
    }

    pub fn keyring_dir(&self) -> &Path {
        &self.keyring_dir
    }

    /// Generate and store the identity's keypair.
    ///
    /// Slow (Argon2id). Idempotent: if a key already exists for
    /// `filesystem_id` it is returned untouched. Concurrent calls for the
    /// same id are serialized; calls for different ids run in parallel.
    pub fn create_identity_key(
        &self,
        filesystem_id: &FilesystemId,
        secret: &SecretString,
    ) -> VaultResult<RecipientKey> {
        let lock = self.creation_lock(filesystem_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(record) = self.load_record(filesystem_id)? {
            tracing::debug!(%filesystem_id, "identity key already exists");
            return Ok(record.public_key);
        }

        let keygen_failed = |reason: String| VaultError::KeyGenFailed {
            filesystem_id: filesystem_id.to_string(),
            reason,
        };

        validate_codename(secret.expose_secret())?;
        let unlock_key = self.unlock_key(secret).map_err(|e| match e {
            VaultError::InvalidCodename(_) => e,
            other => keygen_failed(other.to_string()),
        })?;

        let identity = age::x25519::Identity::generate();
        let public_key = RecipientKey::from(&identity.to_public());
        let identity_str = identity.to_string();
        let sealed = seal::seal(
            &unlock_key,
            filesystem_id.as_str().as_bytes(),
            identity_str.expose_secret().as_bytes(),
        )
        .map_err(|e| keygen_failed(format!("{e:#}")))?;

        let record = KeyRecord {
            version: RECORD_VERSION,
            filesystem_id: filesystem_id.clone(),
            public_key: public_key.clone(),
            sealed_identity: BASE64.encode(sealed),
            created_at: now_epoch(),
        };

        match self.persist_record(&record) {
            Ok(()) => {
                tracing::info!(%filesystem_id, "identity key created");
                Ok(public_key)
            }
            // Another process won the race; its key stands.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(%filesystem_id, "identity key created concurrently");
                self.get_public_key(filesystem_id)
            }
            Err(e) => Err(keygen_failed(format!("writing key record: {e}"))),
        }
    }

    /// Public key for an identity.
    pub fn get_public_key(&self, filesystem_id: &FilesystemId) -> VaultResult<RecipientKey> {
        self.load_record(filesystem_id)?
            .map(|record| record.public_key)
            .ok_or_else(|| VaultError::KeyNotFound(filesystem_id.clone()))
    }

    pub fn has_key(&self, filesystem_id: &FilesystemId) -> bool {
        self.record_path(filesystem_id).exists()
    }

    /// Recover the identity's private key by presenting its codename.
    pub fn unlock(
        &self,
        filesystem_id: &FilesystemId,
        secret: &SecretString,
    ) -> VaultResult<age::x25519::Identity> {
        validate_codename(secret.expose_secret())?;
        let record = self
            .load_record(filesystem_id)?
            .ok_or_else(|| VaultError::KeyNotFound(filesystem_id.clone()))?;

        let sealed = BASE64
            .decode(record.sealed_identity.as_bytes())
            .map_err(|e| VaultError::DecryptionFailed(format!("corrupt key record: {e}")))?;
        let unlock_key = self.unlock_key(secret)?;
        let opened = seal::open(&unlock_key, filesystem_id.as_str().as_bytes(), &sealed)
            .map_err(|_| VaultError::DecryptionFailed("wrong codename for this identity".into()))?;

        let identity_str = std::str::from_utf8(&opened)
            .map_err(|_| VaultError::DecryptionFailed("sealed identity is not UTF-8".into()))?;
        age::x25519::Identity::from_str(identity_str)
            .map_err(|e| VaultError::DecryptionFailed(format!("sealed identity unparseable: {e}")))
    }

    /// Remove an identity's key. Returns whether a key existed.
    pub fn delete_key(&self, filesystem_id: &FilesystemId) -> VaultResult<bool> {
        let lock = self.creation_lock(filesystem_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let removed = match std::fs::remove_file(self.record_path(filesystem_id)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.creation_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(filesystem_id);
        if removed {
            tracing::info!(%filesystem_id, "identity key deleted");
        }
        Ok(removed)
    }

    /// Encrypt for every recipient in `recipients`; see [`envelope::encrypt`].
    pub fn encrypt(&self, plaintext: &[u8], recipients: &[RecipientKey]) -> VaultResult<Vec<u8>> {
        envelope::encrypt(plaintext, recipients)
    }

    /// Stretched codename, narrowed to the sealing domain
    fn unlock_key(&self, secret: &SecretString) -> VaultResult<SealKey> {
        let stretched = self.key_pepper.stretch(secret)?;
        Ok(derive_subkey(&stretched, SEAL_DOMAIN)?)
    }

    fn creation_lock(&self, filesystem_id: &FilesystemId) -> Arc<Mutex<()>> {
        let mut locks = self
            .creation_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(filesystem_id.clone()).or_default().clone()
    }

    fn record_path(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.keyring_dir.join(format!("{filesystem_id}.json"))
    }

    fn load_record(&self, filesystem_id: &FilesystemId) -> VaultResult<Option<KeyRecord>> {
        let path = self.record_path(filesystem_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: KeyRecord = serde_json::from_str(&content)
            .with_context(|| format!("parsing key record: {}", path.display()))?;
        if &record.filesystem_id != filesystem_id {
            return Err(VaultError::InvalidIdentifier(format!(
                "key record {} belongs to another identity",
                path.display()
            )));
        }
        Ok(Some(record))
    }

    fn persist_record(&self, record: &KeyRecord) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.keyring_dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(self.record_path(&record.filesystem_id))
            .map(|_| ())
            .map_err(|e| e.error)
    }
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
