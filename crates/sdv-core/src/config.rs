use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::VaultError;

/// Minimum pepper length in bytes (Argon2 salt floor)
pub const MIN_PEPPER_LEN: usize = 8;

/// Fewest words a generated codename may have
pub const MIN_CODENAME_WORDS: usize = 4;

/// Most words a generated codename may have. BIP-39 English words are at
/// most 8 letters, so 14 words and 13 spaces stay within `MAX_CODENAME_LEN`.
pub const MAX_CODENAME_WORDS: usize = 14;

/// Longest codename accepted for derivation, in bytes
pub const MAX_CODENAME_LEN: usize = 128;

/// Top-level configuration (loaded from sdvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdvConfig {
    pub store: StoreConfig,
    pub keys: KeyConfig,
    pub jobs: JobConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage root; one subdirectory per filesystem id
    pub root: PathBuf,
    /// Extension appended to every stored filename
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Directory holding one sealed key record per identity
    pub keyring_dir: PathBuf,
    /// Organizational age recipient (age1...) added to every encryption
    pub recipient_public_key: Option<String>,
    /// Salt for codename → filesystem id derivation
    pub id_pepper: String,
    /// Salt for codename → key unlock passphrase derivation
    pub key_pepper: String,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Number of words in a generated codename
    pub codename_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Background worker count (0 = available parallelism)
    pub workers: usize,
    /// How often `await_completion` re-checks job state
    pub poll_interval_ms: u64,
    /// How long synchronous callers wait for key generation
    pub keygen_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/sdvault/store"),
            file_extension: "gpg".into(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            keyring_dir: PathBuf::from("/var/lib/sdvault/keys"),
            recipient_public_key: None,
            id_pepper: String::new(),
            key_pepper: String::new(),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            codename_words: 7,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            poll_interval_ms: 100,
            keygen_timeout_secs: 120,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keygen_timeout(&self) -> Duration {
        Duration::from_secs(self.keygen_timeout_secs)
    }

    /// Resolved worker count
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

impl SdvConfig {
    /// Reject configurations the vault must not start with.
    pub fn validate(&self) -> Result<(), VaultError> {
        let ext = &self.store.file_extension;
        if ext.is_empty()
            || ext.starts_with('.')
            || !ext
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.')
        {
            return Err(VaultError::Config(format!(
                "store.file_extension {ext:?} must be lowercase alphanumeric"
            )));
        }
        if self.keys.id_pepper.len() < MIN_PEPPER_LEN {
            return Err(VaultError::Config(format!(
                "keys.id_pepper must be at least {MIN_PEPPER_LEN} bytes"
            )));
        }
        if self.keys.key_pepper.len() < MIN_PEPPER_LEN {
            return Err(VaultError::Config(format!(
                "keys.key_pepper must be at least {MIN_PEPPER_LEN} bytes"
            )));
        }
        if self.keys.id_pepper == self.keys.key_pepper {
            return Err(VaultError::Config(
                "keys.id_pepper and keys.key_pepper must differ".into(),
            ));
        }
        if !(MIN_CODENAME_WORDS..=MAX_CODENAME_WORDS).contains(&self.keys.codename_words) {
            return Err(VaultError::Config(format!(
                "keys.codename_words must be {MIN_CODENAME_WORDS}..={MAX_CODENAME_WORDS}"
            )));
        }
        if self.keys.recipient_public_key.is_none() {
            return Err(VaultError::Config(
                "keys.recipient_public_key is required".into(),
            ));
        }
        if self.jobs.poll_interval_ms == 0 {
            return Err(VaultError::Config(
                "jobs.poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
