//! Error types for object store operations.
//!
//! [`StoreError`] is the single error type returned by every
//! [`ObjectStore`](crate::ObjectStore) method. Variants are specific enough
//! that callers can match on the failure mode (missing object vs. missing
//! path, rejected push) without parsing messages.

use thiserror::Error;

use crate::types::GitOid;

/// Errors returned by [`ObjectStore`](crate::ObjectStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A ref or path does not exist in an object that *is* present locally.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// The object itself is not in the local store (for example it lies
    /// beyond the shallow boundary). Fetching more history may fix this.
    #[error("object {oid} is not present in the local store")]
    MissingObject {
        /// The object that could not be read.
        oid: GitOid,
    },

    /// The commit is present but sits on the shallow boundary: git hides
    /// its parents, so its parent list and changed paths are unknown until
    /// more history is fetched.
    #[error("commit {oid} is at the shallow history boundary; its parents are not present")]
    ShallowBoundary {
        /// The boundary commit.
        oid: GitOid,
    },

    /// A `git` subprocess exited unsuccessfully.
    #[error("`{command}` failed{}: {stderr}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Command {
        /// Summary of the command line (never contains credentials).
        command: String,
        /// Trimmed stderr of the process.
        stderr: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The remote refused a push (hook rejection, auth).
    #[error("push to `{remote}` rejected: {message}")]
    PushRejected {
        /// The remote name or URL.
        remote: String,
        /// Details reported by the remote.
        message: String,
    },

    /// The remote branch moved past the commit being pushed. Replaying the
    /// local commits on the new tip and pushing again can succeed.
    #[error("push to `{remote}` rejected, the remote branch has commits this push lacks: {message}")]
    StaleTip {
        /// The remote name or URL.
        remote: String,
        /// Details reported by the remote.
        message: String,
    },

    /// Replaying local commits onto another tip hit conflicting changes.
    /// The working tree is left as it was before the attempt.
    #[error("replaying onto `{onto}` conflicts: {message}")]
    RebaseConflict {
        /// The ref the commits were replayed onto.
        onto: String,
        /// What git reported.
        message: String,
    },

    /// Store output contained an id that is not a valid SHA-1.
    #[error("invalid OID `{value}`: {reason}")]
    InvalidOid {
        /// The raw value that failed validation.
        value: String,
        /// Why validation failed.
        reason: String,
    },

    /// Filesystem or process-spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unclassified gix failure.
    #[error("git backend error: {message}")]
    Backend {
        /// Freeform error description from the backend.
        message: String,
    },
}

impl StoreError {
    /// `true` when more history might turn this error into a success.
    #[must_use]
    pub const fn is_missing_object(&self) -> bool {
        matches!(self, Self::MissingObject { .. } | Self::ShallowBoundary { .. })
    }
}

impl From<crate::types::OidParseError> for StoreError {
    fn from(e: crate::types::OidParseError) -> Self {
        Self::InvalidOid {
            value: e.value,
            reason: e.reason,
        }
    }
}
