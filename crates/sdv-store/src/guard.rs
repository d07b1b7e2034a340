//! Confinement of filesystem paths to the storage root

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use sdv_core::{VaultError, VaultResult};

/// A path that has been resolved and confirmed to lie strictly inside the
/// storage root. Only [`PathGuard`] can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Gate in front of every read, write, rename and delete under the root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// `root` must exist; it is canonicalized once here.
    pub fn new(root: &Path) -> VaultResult<Self> {
        let root = root.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::NotFound(root.to_path_buf()),
            _ => VaultError::Io(e),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `candidate` and confirm it is a strict descendant of the root.
    ///
    /// Relative paths are taken relative to the root. `..` segments are
    /// rejected outright, symlinks are resolved, and containment is checked
    /// per path component so `{root}_backup` never matches `{root}`.
    /// The path itself need not exist yet.
    pub fn verify(&self, candidate: &Path) -> VaultResult<SafePath> {
        if candidate.as_os_str().is_empty() {
            return Err(self.reject(candidate, "empty path"));
        }
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(self.reject(candidate, "traversal segment"));
        }

        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = resolve(&joined).map_err(|e| {
            tracing::debug!(path = %candidate.display(), error = %e, "path resolution failed");
            self.reject(candidate, "unresolvable")
        })?;

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(self.reject(candidate, "outside storage root"));
        }
        Ok(SafePath(resolved))
    }

    /// Build `{root}/{parts[0]}/{parts[1]}/...` where every part must be a
    /// single plain path component, then [`verify`](Self::verify) it.
    pub fn join(&self, parts: &[&str]) -> VaultResult<SafePath> {
        let mut path = self.root.clone();
        for part in parts {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(c)), None) if c == OsStr::new(part) => path.push(c),
                _ => return Err(self.reject(Path::new(part), "not a single path component")),
            }
        }
        self.verify(&path)
    }

    fn reject(&self, candidate: &Path, reason: &'static str) -> VaultError {
        tracing::warn!(
            target: "sdvault::audit",
            path = %candidate.display(),
            root = %self.root.display(),
            reason,
            "path escape rejected"
        );
        VaultError::PathEscape(candidate.to_path_buf())
    }
}

/// Canonicalize the longest existing prefix of `path` and re-append the
/// rest, so paths that do not exist yet can still be checked.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if existing.symlink_metadata().is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}
