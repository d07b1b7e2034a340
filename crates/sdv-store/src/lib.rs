//! sdv-store: the on-disk side of sdvault
//!
//! Every filesystem operation goes through [`PathGuard`], which only hands
//! out [`SafePath`]s that resolve inside the storage root:
//!
//! ```text
//! {root}/
//!   {filesystem_id}/
//!     1-quiet_harbor-msg.gpg
//!     2-quiet_harbor-doc.gpg
//!     3-quiet_harbor-reply.gpg
//! ```
//!
//! [`Vault`] wires the guard, layout, exporter, keystore and job pool
//! together for callers that hold source records.

pub mod archive;
pub mod guard;
pub mod health;
pub mod layout;
pub mod vault;

pub use archive::ArchiveExporter;
pub use guard::{PathGuard, SafePath};
pub use layout::{SourceIdentity, SubmissionLayout};
pub use vault::{NewSource, PendingSource, Vault};
