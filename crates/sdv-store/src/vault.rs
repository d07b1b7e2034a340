//! The vault: identity creation, encrypted storage and export behind one handle

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sdv_core::{
    DisplayLabel, FileKind, FilesystemId, SdvConfig, SourceRecord, StoredFile, VaultError,
    VaultResult,
};
use sdv_crypto::{run_startup_check, BackendProbe, IdentityCodec, KeyStore, RecipientKey};
use sdv_jobs::{JobHandle, JobPool};
use secrecy::{ExposeSecret, SecretString};

use crate::archive::ArchiveExporter;
use crate::health;
use crate::layout::{SourceIdentity, SubmissionLayout};

/// A freshly created source. The codename is shown to the source once and
/// never stored.
#[derive(Debug)]
pub struct NewSource {
    pub codename: SecretString,
    pub identity: Arc<SourceIdentity>,
}

/// A source whose identity key is still being generated on the job pool.
///
/// Hand it back to [`Vault::finish_source`] to wait again, or to
/// [`Vault::abandon_source`] to have its directory and key removed once
/// the job ends.
#[derive(Debug)]
pub struct PendingSource {
    codename: SecretString,
    filesystem_id: FilesystemId,
    display_label: DisplayLabel,
    job: JobHandle,
}

impl PendingSource {
    pub fn filesystem_id(&self) -> &FilesystemId {
        &self.filesystem_id
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }
}

pub struct Vault {
    codec: IdentityCodec,
    keys: Arc<KeyStore>,
    layout: SubmissionLayout,
    exporter: ArchiveExporter,
    jobs: JobPool,
    org_key: RecipientKey,
    keygen_timeout: Duration,
    poll_interval: Duration,
    sources: Mutex<HashMap<FilesystemId, Arc<SourceIdentity>>>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.layout.guard().root())
            .field("keys", &self.keys)
            .field("jobs", &self.jobs)
            .field("org_key", &self.org_key)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Validate `config`, run the backend self-check, then open the store
    /// and keyring. No vault exists unless `probe` passes.
    pub fn open(config: &SdvConfig, probe: &dyn BackendProbe) -> VaultResult<Self> {
        config.validate()?;
        let org_key = config
            .keys
            .recipient_public_key
            .as_deref()
            .map(RecipientKey::new)
            .ok_or_else(|| VaultError::Config("keys.recipient_public_key is required".into()))?;
        org_key
            .validate()
            .map_err(|e| VaultError::Config(format!("keys.recipient_public_key: {e}")))?;

        run_startup_check(probe)?;

        let layout = SubmissionLayout::from_config(&config.store)?;
        health::check_health(layout.guard().root())?;
        let keys = Arc::new(KeyStore::from_config(&config.keys)?);

        tracing::info!(
            root = %layout.guard().root().display(),
            keyring = %keys.keyring_dir().display(),
            "vault opened"
        );
        Ok(Self {
            codec: IdentityCodec::from_config(&config.keys),
            exporter: ArchiveExporter::new(layout.guard().clone()),
            jobs: JobPool::from_config(&config.jobs),
            keygen_timeout: config.jobs.keygen_timeout(),
            poll_interval: config.jobs.poll_interval(),
            sources: Mutex::new(HashMap::new()),
            keys,
            layout,
            org_key,
        })
    }

    pub fn layout(&self) -> &SubmissionLayout {
        &self.layout
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn org_recipient(&self) -> &RecipientKey {
        &self.org_key
    }

    pub fn health(&self) -> anyhow::Result<()> {
        health::check_health(self.layout.guard().root())
    }

    /// Create a new source and wait up to the configured keygen timeout for
    /// its identity key.
    ///
    /// On `JobTimeout` the source is abandoned: its directory and key are
    /// removed in the background once key generation ends. Callers that
    /// want to keep waiting use [`start_source`](Self::start_source) and
    /// [`finish_source`](Self::finish_source) instead.
    pub async fn create_source(&self) -> VaultResult<NewSource> {
        let pending = self.start_source().await?;
        match self.finish_source(&pending, self.keygen_timeout).await {
            Err(e @ VaultError::JobTimeout { .. }) => {
                self.abandon_source(pending);
                Err(e)
            }
            other => other,
        }
    }

    /// Draw a codename and label, derive the filesystem id, create the
    /// source directory and queue key generation. Returns without waiting
    /// for the key.
    pub async fn start_source(&self) -> VaultResult<PendingSource> {
        let codename = self.codec.generate_secret()?;
        let display_label = self.codec.generate_display_label()?;

        let codec = self.codec.clone();
        let secret = clone_secret(&codename);
        let filesystem_id = tokio::task::spawn_blocking(move || codec.derive_filesystem_id(&secret))
            .await
            .map_err(|e| anyhow::anyhow!("deriving filesystem id: {e}"))??;

        self.layout.create_source_dir(&filesystem_id)?;

        let keys = self.keys.clone();
        let id = filesystem_id.clone();
        let secret = clone_secret(&codename);
        let job = self.jobs.submit("keygen", move || {
            keys.create_identity_key(&id, &secret)?;
            Ok(())
        });
        tracing::debug!(%filesystem_id, job_id = %job.id(), "source pending key generation");

        Ok(PendingSource {
            codename,
            filesystem_id,
            display_label,
            job,
        })
    }

    /// Wait up to `timeout` for a pending source's key. May be called again
    /// after `JobTimeout`. On `JobFailed` the source directory is removed.
    pub async fn finish_source(
        &self,
        pending: &PendingSource,
        timeout: Duration,
    ) -> VaultResult<NewSource> {
        let filesystem_id = &pending.filesystem_id;
        if let Err(e) = self.jobs.await_completion(&pending.job, timeout).await {
            if matches!(e, VaultError::JobFailed { .. }) {
                if let Err(cleanup) = self.layout.delete_source_dir(filesystem_id) {
                    tracing::warn!(%filesystem_id, error = %cleanup, "cleanup after failed keygen");
                }
            }
            return Err(e);
        }

        let identity = self
            .lock_sources()
            .entry(filesystem_id.clone())
            .or_insert_with(|| {
                Arc::new(SourceIdentity::new(
                    filesystem_id.clone(),
                    pending.display_label.clone(),
                ))
            })
            .clone();
        tracing::info!(%filesystem_id, job_id = %pending.job.id(), "source created");
        Ok(NewSource {
            codename: clone_secret(&pending.codename),
            identity,
        })
    }

    /// Give up on a pending source. Once its key generation ends, whether
    /// it succeeded or not, the source directory and any key written are
    /// deleted. Must be called within a Tokio runtime.
    pub fn abandon_source(&self, pending: PendingSource) {
        let PendingSource {
            filesystem_id, job, ..
        } = pending;
        let layout = self.layout.clone();
        let keys = self.keys.clone();
        let poll_interval = self.poll_interval;
        tracing::warn!(%filesystem_id, job_id = %job.id(), "source abandoned");

        tokio::spawn(async move {
            while !job.status().is_terminal() {
                tokio::time::sleep(poll_interval).await;
            }
            let dir = layout.delete_source_dir(&filesystem_id);
            let key = keys.delete_key(&filesystem_id);
            match (dir, key) {
                (Ok(had_dir), Ok(had_key)) => {
                    tracing::info!(%filesystem_id, had_dir, had_key, "abandoned source removed")
                }
                (dir, key) => tracing::error!(
                    %filesystem_id,
                    dir_error = ?dir.err(),
                    key_error = ?key.err(),
                    "abandoned source cleanup failed"
                ),
            }
        });
    }

    /// Live identity for `record`, shared by every caller serving this
    /// source. A record with a higher count raises the live counter; a
    /// stale one never lowers it.
    pub fn load_source(&self, record: &SourceRecord) -> Arc<SourceIdentity> {
        let identity = self
            .lock_sources()
            .entry(record.filesystem_id.clone())
            .or_insert_with(|| Arc::new(SourceIdentity::from_record(record)))
            .clone();
        identity.observe_count(record.interaction_count);
        identity
    }

    pub fn save_message_submission(
        &self,
        identity: &SourceIdentity,
        message: &str,
    ) -> VaultResult<StoredFile> {
        self.store(identity, FileKind::Message, message.as_bytes())
    }

    pub fn save_file_submission(
        &self,
        identity: &SourceIdentity,
        contents: &[u8],
    ) -> VaultResult<StoredFile> {
        self.store(identity, FileKind::Document, contents)
    }

    pub fn save_reply(&self, identity: &SourceIdentity, message: &str) -> VaultResult<StoredFile> {
        self.store(identity, FileKind::Reply, message.as_bytes())
    }

    /// Give the source a new display label, renaming its stored files.
    pub fn relabel(
        &self,
        identity: &SourceIdentity,
        new_label: &DisplayLabel,
    ) -> VaultResult<Vec<(String, String)>> {
        self.layout.relabel(identity, new_label)
    }

    pub fn list_files(&self, filesystem_id: &FilesystemId) -> VaultResult<Vec<StoredFile>> {
        self.layout.list_files(filesystem_id)
    }

    /// Tar the given `(filesystem_id, filename)` pairs in order.
    pub fn bulk_archive(&self, files: &[(FilesystemId, String)]) -> VaultResult<Vec<u8>> {
        let paths: Vec<PathBuf> = files
            .iter()
            .map(|(filesystem_id, filename)| Path::new(filesystem_id.as_str()).join(filename))
            .collect();
        self.exporter.build_archive(&paths)
    }

    /// Decrypt one of the source's own files by presenting its codename.
    pub fn read_for_source(&self, codename: &SecretString, filename: &str) -> VaultResult<Vec<u8>> {
        let filesystem_id = self.codec.derive_filesystem_id(codename)?;
        let identity = self.keys.unlock(&filesystem_id, codename)?;
        let ciphertext = self.layout.read_file(&filesystem_id, filename)?;
        sdv_crypto::decrypt(&ciphertext, &identity)
    }

    /// Delete a source's directory and key together. Returns whether
    /// anything existed.
    pub fn delete_source(&self, filesystem_id: &FilesystemId) -> VaultResult<bool> {
        self.lock_sources().remove(filesystem_id);
        let had_dir = self.layout.delete_source_dir(filesystem_id)?;
        let had_key = self.keys.delete_key(filesystem_id)?;
        tracing::info!(%filesystem_id, had_dir, had_key, "source deleted");
        Ok(had_dir || had_key)
    }

    fn store(
        &self,
        identity: &SourceIdentity,
        kind: FileKind,
        plaintext: &[u8],
    ) -> VaultResult<StoredFile> {
        let filesystem_id = identity.filesystem_id();
        let source_key = self.keys.get_public_key(filesystem_id)?;
        let ciphertext = self
            .keys
            .encrypt(plaintext, &[source_key, self.org_key.clone()])?;

        let stored = self.layout.append_file(identity, kind, &ciphertext)?;
        tracing::info!(%filesystem_id, filename = %stored.name, kind = kind.suffix(), "file stored");
        Ok(stored)
    }

    fn lock_sources(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<FilesystemId, Arc<SourceIdentity>>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
