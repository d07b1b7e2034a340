//! Storage root health check

use std::path::Path;

use anyhow::{Context, Result};

/// Verify the storage root is a directory we can create files in
pub fn check_health(root: &Path) -> Result<()> {
    let metadata = std::fs::metadata(root)
        .with_context(|| format!("storage root {} unreadable", root.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("storage root {} is not a directory", root.display());
    }
    // Unnamed temp file: removed by the OS as soon as it is dropped
    tempfile::tempfile_in(root)
        .with_context(|| format!("storage root {} not writable", root.display()))?;
    Ok(())
}
