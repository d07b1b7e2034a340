use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{FilesystemId, RenameReport};

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("path escapes storage root: {}", .0.display())]
    PathEscape(PathBuf),

    #[error("invalid codename: {0}")]
    InvalidCodename(&'static str),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("key generation failed for {filesystem_id}: {reason}")]
    KeyGenFailed {
        filesystem_id: String,
        reason: String,
    },

    #[error("crypto backend unhealthy: {0}")]
    CryptoBackendUnhealthy(String),

    #[error("no key stored for {0}")]
    KeyNotFound(FilesystemId),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("storage write failed for {}: {source}", path.display())]
    StorageWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "rename conflict: {reason} ({} completed, {} not attempted)",
        report.completed.len(),
        report.not_attempted.len()
    )]
    RenameConflict { reason: String, report: RenameReport },

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("archive failed: {0}")]
    ArchiveFailed(String),

    #[error("job {job_id} still pending after {waited:?}")]
    JobTimeout { job_id: String, waited: Duration },

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Errors that must reach the audit log, not just the caller.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            VaultError::PathEscape(_) | VaultError::CryptoBackendUnhealthy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_events_are_flagged() {
        assert!(VaultError::PathEscape(PathBuf::from("/etc/passwd")).is_security_event());
        assert!(VaultError::CryptoBackendUnhealthy("self-check".into()).is_security_event());
        assert!(!VaultError::EncryptionFailed("bad key".into()).is_security_event());
    }

    #[test]
    fn rename_conflict_message_counts_files() {
        let err = VaultError::RenameConflict {
            reason: "destination exists".into(),
            report: RenameReport {
                completed: vec![("1-a-msg.gpg".into(), "1-b-msg.gpg".into())],
                not_attempted: vec![],
                failed: None,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("1 completed"));
        assert!(msg.contains("0 not attempted"));
    }
}
