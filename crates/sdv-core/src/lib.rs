pub mod config;
pub mod error;
pub mod types;

pub use config::SdvConfig;
pub use error::{VaultError, VaultResult};
pub use types::{
    DisplayLabel, FileKind, FilesystemId, RenameReport, SourceRecord, StoredFile, StoredFileName,
};
