//! Per-source directories and canonical stored filenames

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use sdv_core::config::StoreConfig;
use sdv_core::{
    DisplayLabel, FileKind, FilesystemId, RenameReport, SourceRecord, StoredFile, StoredFileName,
    VaultError, VaultResult,
};

use crate::guard::{PathGuard, SafePath};

/// A source identity as held in memory while requests are served.
///
/// The mutex is the per-identity serialization point: counter increments,
/// filename formatting and relabel passes for one source never interleave.
/// Different sources never contend.
#[derive(Debug)]
pub struct SourceIdentity {
    filesystem_id: FilesystemId,
    state: Mutex<IdentityState>,
}

#[derive(Debug)]
struct IdentityState {
    display_label: DisplayLabel,
    interaction_count: u64,
}

impl SourceIdentity {
    pub fn new(filesystem_id: FilesystemId, display_label: DisplayLabel) -> Self {
        Self::from_record(&SourceRecord {
            filesystem_id,
            display_label,
            interaction_count: 0,
        })
    }

    pub fn from_record(record: &SourceRecord) -> Self {
        Self {
            filesystem_id: record.filesystem_id.clone(),
            state: Mutex::new(IdentityState {
                display_label: record.display_label.clone(),
                interaction_count: record.interaction_count,
            }),
        }
    }

    /// Snapshot for the record layer to persist.
    pub fn to_record(&self) -> SourceRecord {
        let state = self.lock();
        SourceRecord {
            filesystem_id: self.filesystem_id.clone(),
            display_label: state.display_label.clone(),
            interaction_count: state.interaction_count,
        }
    }

    pub fn filesystem_id(&self) -> &FilesystemId {
        &self.filesystem_id
    }

    pub fn display_label(&self) -> DisplayLabel {
        self.lock().display_label.clone()
    }

    pub fn interaction_count(&self) -> u64 {
        self.lock().interaction_count
    }

    /// Raise the counter to at least `count`. The counter never goes down.
    pub(crate) fn observe_count(&self, count: u64) {
        let mut state = self.lock();
        state.interaction_count = state.interaction_count.max(count);
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Filenames and file operations under the storage root.
#[derive(Debug, Clone)]
pub struct SubmissionLayout {
    guard: PathGuard,
    extension: String,
}

impl SubmissionLayout {
    pub fn new(guard: PathGuard, extension: &str) -> Self {
        Self {
            guard,
            extension: extension.to_string(),
        }
    }

    /// Create the storage root if needed and guard it.
    pub fn from_config(config: &StoreConfig) -> VaultResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        let guard = PathGuard::new(&config.root)?;
        Ok(Self::new(guard, &config.file_extension))
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn source_dir(&self, filesystem_id: &FilesystemId) -> VaultResult<SafePath> {
        self.guard.join(&[filesystem_id.as_str()])
    }

    pub fn create_source_dir(&self, filesystem_id: &FilesystemId) -> VaultResult<SafePath> {
        let dir = self.source_dir(filesystem_id)?;
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(dir)
    }

    /// Increment the identity's counter and format the next filename with
    /// the post-increment value and the current label, as one step.
    pub fn next_filename(&self, identity: &SourceIdentity, kind: FileKind) -> StoredFileName {
        let mut state = identity.lock();
        self.advance(&mut state, kind)
    }

    /// Name and write the identity's next file while holding its lock, so
    /// no relabel can run between choosing the name and writing it.
    pub fn append_file(
        &self,
        identity: &SourceIdentity,
        kind: FileKind,
        ciphertext: &[u8],
    ) -> VaultResult<StoredFile> {
        let mut state = identity.lock();
        let name = self.advance(&mut state, kind);
        self.persist(identity.filesystem_id(), &name, ciphertext)
    }

    /// Durably write `ciphertext` under `name` in the identity's directory.
    ///
    /// The file always carries the identity's current label: if the source
    /// was relabelled after `name` was issued, the returned [`StoredFile`]
    /// has the new label with the same sequence and kind. The bytes go to a
    /// temp file in the same directory, are synced, and only then appear
    /// under the final name. An existing file with that name is never
    /// overwritten.
    pub fn write_file(
        &self,
        identity: &SourceIdentity,
        name: &StoredFileName,
        ciphertext: &[u8],
    ) -> VaultResult<StoredFile> {
        let state = identity.lock();
        let name = name.with_label(&state.display_label);
        self.persist(identity.filesystem_id(), &name, ciphertext)
    }

    /// Rename every stored file of `identity` labelled `old_label` to carry
    /// `new_label`, then make `new_label` the identity's label.
    ///
    /// All destinations are checked before anything moves. If a rename
    /// still fails partway, the error carries a [`RenameReport`] listing
    /// what moved and what did not, and the label is left unchanged so the
    /// same call can be retried. Returns `(old, new)` filename pairs in
    /// sequence order.
    pub fn rename_for_new_label(
        &self,
        identity: &SourceIdentity,
        old_label: &DisplayLabel,
        new_label: &DisplayLabel,
    ) -> VaultResult<Vec<(String, String)>> {
        let mut state = identity.lock();
        self.relabel_locked(&mut state, identity, old_label, new_label, rename_noclobber)
    }

    /// [`rename_for_new_label`](Self::rename_for_new_label) from whatever
    /// label the identity carries at the moment its lock is taken.
    pub fn relabel(
        &self,
        identity: &SourceIdentity,
        new_label: &DisplayLabel,
    ) -> VaultResult<Vec<(String, String)>> {
        let mut state = identity.lock();
        let old_label = state.display_label.clone();
        self.relabel_locked(&mut state, identity, &old_label, new_label, rename_noclobber)
    }

    fn relabel_locked<F>(
        &self,
        state: &mut IdentityState,
        identity: &SourceIdentity,
        old_label: &DisplayLabel,
        new_label: &DisplayLabel,
        mut rename: F,
    ) -> VaultResult<Vec<(String, String)>>
    where
        F: FnMut(&Path, &Path) -> std::io::Result<()>,
    {
        let filesystem_id = identity.filesystem_id();

        let mut matched: Vec<StoredFileName> = self
            .stored_names(filesystem_id)?
            .into_iter()
            .filter(|name| name.label == *old_label)
            .collect();
        matched.sort_by_key(|name| name.sequence);

        let plan: Vec<(String, String)> = if old_label == new_label {
            Vec::new()
        } else {
            matched
                .iter()
                .map(|name| (name.to_string(), name.with_label(new_label).to_string()))
                .collect()
        };

        let mut moves = Vec::with_capacity(plan.len());
        for (old, new) in &plan {
            let from = self.guard.join(&[filesystem_id.as_str(), old])?;
            let to = self.guard.join(&[filesystem_id.as_str(), new])?;
            if to.as_path().symlink_metadata().is_ok() {
                return Err(VaultError::RenameConflict {
                    reason: format!("destination {new} already exists"),
                    report: RenameReport {
                        completed: Vec::new(),
                        not_attempted: plan.clone(),
                        failed: None,
                    },
                });
            }
            moves.push((from, to));
        }

        for (i, (from, to)) in moves.iter().enumerate() {
            if let Err(e) = rename(from.as_path(), to.as_path()) {
                let report = RenameReport {
                    completed: plan[..i].to_vec(),
                    not_attempted: plan[i + 1..].to_vec(),
                    failed: Some(plan[i].clone()),
                };
                tracing::error!(
                    %filesystem_id,
                    filename = %plan[i].0,
                    completed = report.completed.len(),
                    not_attempted = report.not_attempted.len(),
                    error = %e,
                    "relabel stopped partway"
                );
                return Err(VaultError::RenameConflict {
                    reason: format!("renaming {}: {e}", plan[i].0),
                    report,
                });
            }
        }

        state.display_label = new_label.clone();
        tracing::info!(%filesystem_id, renamed = plan.len(), "source relabelled");
        Ok(plan)
    }

    /// Rename a single stored file to carry `new_label`.
    pub fn rename_file(
        &self,
        filesystem_id: &FilesystemId,
        filename: &str,
        new_label: &DisplayLabel,
    ) -> VaultResult<StoredFileName> {
        let name = StoredFileName::parse(filename)
            .ok_or_else(|| VaultError::InvalidIdentifier(format!("stored filename: {filename:?}")))?;
        let renamed = name.with_label(new_label);
        if renamed == name {
            return Ok(renamed);
        }

        let new = renamed.to_string();
        let from = self.existing(filesystem_id, filename)?;
        let to = self.guard.join(&[filesystem_id.as_str(), &new])?;

        rename_noclobber(from.as_path(), to.as_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                VaultError::RenameConflict {
                    reason: format!("destination {new} already exists"),
                    report: RenameReport {
                        failed: Some((filename.to_string(), new.clone())),
                        ..RenameReport::default()
                    },
                }
            } else {
                VaultError::Io(e)
            }
        })?;
        tracing::debug!(%filesystem_id, from = filename, to = %new, "stored file renamed");
        Ok(renamed)
    }

    /// Stored files of one source in sequence order. Files whose names do
    /// not parse (temp files, strays) are skipped.
    pub fn list_files(&self, filesystem_id: &FilesystemId) -> VaultResult<Vec<StoredFile>> {
        let dir = self.source_dir(filesystem_id)?;
        let entries = read_dir(dir.as_path())?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(StoredFileName::parse) else {
                continue;
            };
            files.push(StoredFile {
                filesystem_id: filesystem_id.clone(),
                name,
                size: metadata.len(),
            });
        }
        files.sort_by(|a, b| {
            (a.name.sequence, a.filename()).cmp(&(b.name.sequence, b.filename()))
        });
        Ok(files)
    }

    pub fn read_file(&self, filesystem_id: &FilesystemId, filename: &str) -> VaultResult<Vec<u8>> {
        let path = self.existing(filesystem_id, filename)?;
        Ok(std::fs::read(&path)?)
    }

    pub fn delete_file(&self, filesystem_id: &FilesystemId, filename: &str) -> VaultResult<()> {
        let path = self.existing(filesystem_id, filename)?;
        std::fs::remove_file(&path)?;
        tracing::info!(%filesystem_id, filename, "stored file deleted");
        Ok(())
    }

    /// Remove a source's directory and everything in it. Returns whether
    /// the directory existed.
    pub fn delete_source_dir(&self, filesystem_id: &FilesystemId) -> VaultResult<bool> {
        let dir = self.source_dir(filesystem_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(%filesystem_id, "source directory deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn advance(&self, state: &mut IdentityState, kind: FileKind) -> StoredFileName {
        state.interaction_count += 1;
        StoredFileName::new(
            state.interaction_count,
            state.display_label.clone(),
            kind,
            &self.extension,
        )
    }

    /// Temp file, sync, no-clobber rename. Callers hold the identity lock.
    fn persist(
        &self,
        filesystem_id: &FilesystemId,
        name: &StoredFileName,
        ciphertext: &[u8],
    ) -> VaultResult<StoredFile> {
        let dir = self.create_source_dir(filesystem_id)?;
        let filename = name.to_string();
        let dest = self.guard.join(&[filesystem_id.as_str(), &filename])?;
        let write_failed = |source: std::io::Error| VaultError::StorageWriteFailed {
            path: dest.as_path().to_path_buf(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&dir)
            .map_err(write_failed)?;
        tmp.write_all(ciphertext).map_err(write_failed)?;
        tmp.as_file().sync_all().map_err(write_failed)?;
        tmp.persist_noclobber(&dest)
            .map_err(|e| write_failed(e.error))?;

        // The file is complete under its final name at this point; a failed
        // directory sync only weakens durability across a crash.
        if let Err(e) = sync_dir(dir.as_path()) {
            tracing::warn!(
                %filesystem_id,
                %filename,
                error = %e,
                "directory sync failed after write"
            );
        }

        tracing::debug!(%filesystem_id, %filename, bytes = ciphertext.len(), "stored file written");
        Ok(StoredFile {
            filesystem_id: filesystem_id.clone(),
            name: name.clone(),
            size: ciphertext.len() as u64,
        })
    }

    fn stored_names(&self, filesystem_id: &FilesystemId) -> VaultResult<Vec<StoredFileName>> {
        Ok(self
            .list_files(filesystem_id)?
            .into_iter()
            .map(|file| file.name)
            .collect())
    }

    fn existing(&self, filesystem_id: &FilesystemId, filename: &str) -> VaultResult<SafePath> {
        let path = self.guard.join(&[filesystem_id.as_str(), filename])?;
        if !path.as_path().is_file() {
            return Err(VaultError::NotFound(path.into_path_buf()));
        }
        Ok(path)
    }
}

fn read_dir(dir: &Path) -> VaultResult<std::fs::ReadDir> {
    std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VaultError::NotFound(dir.to_path_buf()),
        _ => VaultError::Io(e),
    })
}

/// Move `from` to `to`, failing with `AlreadyExists` instead of replacing.
fn rename_noclobber(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::hard_link(from, to)?;
    if let Err(e) = std::fs::remove_file(from) {
        std::fs::remove_file(to).ok();
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
