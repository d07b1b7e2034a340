//! Bulk export of stored files as a single tar bundle

use std::fs::File;
use std::path::Path;
use std::time::UNIX_EPOCH;

use sdv_core::{VaultError, VaultResult};

use crate::guard::{PathGuard, SafePath};

/// Packages stored files into one archive. Contents are copied as-is;
/// nothing is decrypted.
#[derive(Debug, Clone)]
pub struct ArchiveExporter {
    guard: PathGuard,
}

impl ArchiveExporter {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    /// Build an in-memory tar of `paths` in the given order.
    ///
    /// Each path is resolved against the storage root and must pass the
    /// guard before anything is read. Entries carry the file's own name as
    /// the caller gave it, with no directory part. Repeated names are kept
    /// as separate entries.
    pub fn build_archive<P: AsRef<Path>>(&self, paths: &[P]) -> VaultResult<Vec<u8>> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let given = path.as_ref();
            let safe = self.guard.verify(given)?;
            let name = given.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
                VaultError::ArchiveFailed(format!("no file name in {}", given.display()))
            })?;
            entries.push((name.to_string(), safe));
        }

        let mut builder = tar::Builder::new(Vec::new());
        for (name, path) in &entries {
            append_entry(&mut builder, name, path)?;
        }
        let archive = builder
            .into_inner()
            .map_err(|e| VaultError::ArchiveFailed(e.to_string()))?;

        tracing::info!(files = entries.len(), bytes = archive.len(), "bulk archive built");
        Ok(archive)
    }
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    path: &SafePath,
) -> VaultResult<()> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VaultError::NotFound(path.as_path().to_path_buf()),
        _ => VaultError::Io(e),
    })?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(VaultError::NotFound(path.as_path().to_path_buf()));
    }
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(metadata.len());
    header.set_mode(0o600);
    header.set_mtime(mtime);
    builder
        .append_data(&mut header, name, file)
        .map_err(|e| VaultError::ArchiveFailed(format!("{name}: {e}")))
}
