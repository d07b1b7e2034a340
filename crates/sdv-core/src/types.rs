use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VaultError;

/// Length of a hex-encoded filesystem id (256-bit digest)
pub const FILESYSTEM_ID_LEN: usize = 64;

/// Upper bound on display label length
pub const MAX_LABEL_LEN: usize = 64;

/// One-way identifier derived from a source's codename.
///
/// Names both the source's storage directory and its keyring entry, so it
/// is restricted to lowercase hex and can never carry a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilesystemId(String);

impl FilesystemId {
    pub fn parse(s: &str) -> Result<Self, VaultError> {
        let valid = s.len() == FILESYSTEM_ID_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(VaultError::InvalidIdentifier(format!(
                "filesystem id must be {FILESYSTEM_ID_LEN} lowercase hex chars"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FilesystemId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FilesystemId {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FilesystemId> for String {
    fn from(id: FilesystemId) -> Self {
        id.0
    }
}

/// Human-readable alias shown to recipients, e.g. `quiet_harbor`.
///
/// Allowed characters are `[a-z0-9_]`; `-` is reserved as the field
/// separator in stored filenames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayLabel(String);

impl DisplayLabel {
    pub fn parse(s: &str) -> Result<Self, VaultError> {
        if s.is_empty() || s.len() > MAX_LABEL_LEN {
            return Err(VaultError::InvalidIdentifier(format!(
                "display label must be 1..={MAX_LABEL_LEN} chars"
            )));
        }
        if !s
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_'))
        {
            return Err(VaultError::InvalidIdentifier(format!(
                "display label {s:?} contains characters outside [a-z0-9_]"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DisplayLabel {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DisplayLabel {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DisplayLabel> for String {
    fn from(label: DisplayLabel) -> Self {
        label.0
    }
}

/// What a stored file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Text message from a source
    Message,
    /// Uploaded document from a source
    Document,
    /// Reply from a recipient to a source
    Reply,
}

impl FileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Message => "msg",
            FileKind::Document => "doc",
            FileKind::Reply => "reply",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "msg" => Some(FileKind::Message),
            "doc" => Some(FileKind::Document),
            "reply" => Some(FileKind::Reply),
            _ => None,
        }
    }
}

/// Canonical stored filename: `{sequence}-{label}-{suffix}.{extension}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoredFileName {
    pub sequence: u64,
    pub label: DisplayLabel,
    pub kind: FileKind,
    pub extension: String,
}

impl StoredFileName {
    pub fn new(sequence: u64, label: DisplayLabel, kind: FileKind, extension: &str) -> Self {
        Self {
            sequence,
            label,
            kind,
            extension: extension.to_string(),
        }
    }

    /// Parse a filename produced by [`fmt::Display`]. Returns `None` for
    /// anything else (temp files, foreign files, zero-padded sequences).
    pub fn parse(name: &str) -> Option<Self> {
        let (stem, extension) = name.split_once('.')?;
        if extension.is_empty()
            || !extension
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.')
        {
            return None;
        }
        let (sequence, rest) = stem.split_once('-')?;
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (label, suffix) = rest.rsplit_once('-')?;
        let parsed = Self {
            sequence: sequence.parse().ok()?,
            label: DisplayLabel::parse(label).ok()?,
            kind: FileKind::from_suffix(suffix)?,
            extension: extension.to_string(),
        };
        // Only names that format back to themselves, so `01-...` is foreign.
        (parsed.to_string() == name).then_some(parsed)
    }

    /// Same file under a different owner label
    pub fn with_label(&self, label: &DisplayLabel) -> Self {
        Self {
            label: label.clone(),
            ..self.clone()
        }
    }
}

impl fmt::Display for StoredFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}",
            self.sequence,
            self.label,
            self.kind.suffix(),
            self.extension
        )
    }
}

impl TryFrom<String> for StoredFileName {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
            .ok_or_else(|| VaultError::InvalidIdentifier(format!("stored filename: {s:?}")))
    }
}

impl From<StoredFileName> for String {
    fn from(name: StoredFileName) -> Self {
        name.to_string()
    }
}

/// Identity fields exchanged with the record layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub filesystem_id: FilesystemId,
    pub display_label: DisplayLabel,
    pub interaction_count: u64,
}

/// Metadata for one encrypted file written to the store, for the caller to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub filesystem_id: FilesystemId,
    pub name: StoredFileName,
    /// Ciphertext size in bytes
    pub size: u64,
}

impl StoredFile {
    pub fn filename(&self) -> String {
        self.name.to_string()
    }
}

/// Outcome of a relabel pass that stopped partway.
///
/// Each entry is `(old_filename, new_filename)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameReport {
    /// Renames that took effect
    pub completed: Vec<(String, String)>,
    /// Renames never tried because the pass stopped first
    pub not_attempted: Vec<(String, String)>,
    /// The rename that failed, if the pass failed on a rename
    pub failed: Option<(String, String)>,
}
