//! treesync data model: identifiers and commit records.

pub mod commit;
pub mod types;

pub use commit::{CommitRecord, FileChange};
pub use types::{PrincipalId, RepoSlug, SessionId, ValidationError};
