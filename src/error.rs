//! Error taxonomy for treesync.
//!
//! [`SyncError`] is returned by the replica engine, the relay client and the
//! write-session manager. Messages are written for whoever receives them
//! over HTTP or in a log line: each says what went wrong and, where there is
//! something to do about it, ends with a `To fix:` line.

use std::fmt;
use std::path::PathBuf;

use treesync_git::{GitOid, StoreError};

use crate::model::{PrincipalId, RepoSlug, SessionId};

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SyncError {
    /// A fresh shallow clone of the upstream failed.
    Bootstrap { repo: RepoSlug, detail: String },

    /// Applying a commit event to a replica failed (fetch, verify or
    /// checkout). The replica keeps its previous cursor.
    ApplyCommit {
        repo: RepoSlug,
        oid: GitOid,
        detail: String,
    },

    /// An active session (or one being opened) already exists for this
    /// principal and repository.
    SessionConflict {
        principal: PrincipalId,
        repo: RepoSlug,
        existing: Option<SessionId>,
    },

    /// `commit` was called with nothing pending.
    EmptyCommit { session: SessionId },

    /// Pushing a session branch upstream failed.
    Push { session: SessionId, detail: String },

    /// A path or object does not exist (after any permitted deepen retry).
    NotFound { what: String },

    SessionNotFound { session: String },

    /// A staged path escapes the workspace or is otherwise unusable.
    InvalidPath { path: String, reason: String },

    /// An operation queued behind a failed one in the same session chain.
    ChainAborted { session: SessionId, cause: String },

    /// The upstream hosting API or a remote relay failed.
    Upstream { url: String, detail: String },

    /// An identifier failed validation.
    Invalid { value: String, reason: String },

    Store(StoreError),

    Config { path: PathBuf, detail: String },

    Io(std::io::Error),
}

impl SyncError {
    /// Stable machine-readable code, used as the `error` field of HTTP
    /// error bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "bootstrap_failed",
            Self::ApplyCommit { .. } => "apply_commit_failed",
            Self::SessionConflict { .. } => "session_conflict",
            Self::EmptyCommit { .. } => "empty_commit",
            Self::Push { .. } => "push_failed",
            Self::NotFound { .. } => "not_found",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::InvalidPath { .. } => "invalid_path",
            Self::ChainAborted { .. } => "chain_aborted",
            Self::Upstream { .. } => "upstream_error",
            Self::Invalid { .. } => "invalid_argument",
            Self::Store(_) => "store_error",
            Self::Config { .. } => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    /// `true` for missing-object store errors that more history may fix.
    #[must_use]
    pub const fn is_missing_object(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_missing_object())
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap { repo, detail } => {
                write!(
                    f,
                    "bootstrap of '{repo}' failed: {detail}\n  To fix: check the upstream URL and network, then run:\n    treesync replica sync {repo} --full"
                )
            }
            Self::ApplyCommit { repo, oid, detail } => {
                write!(
                    f,
                    "could not apply commit {} to '{repo}': {detail}\n  To fix: resync the replica:\n    treesync replica sync {repo} --full",
                    oid.short()
                )
            }
            Self::SessionConflict {
                principal,
                repo,
                existing,
            } => {
                write!(f, "'{principal}' already has an active session on '{repo}'")?;
                if let Some(id) = existing {
                    write!(f, " ({id})")?;
                }
                write!(
                    f,
                    ".\n  To fix: keep using the existing session, or close it first."
                )
            }
            Self::EmptyCommit { session } => {
                write!(
                    f,
                    "session {session} has no pending changes to commit.\n  To fix: stage at least one file before committing."
                )
            }
            Self::Push { session, detail } => {
                write!(
                    f,
                    "push from session {session} failed: {detail}\n  To fix: the commit is kept on the session branch; retry the push."
                )
            }
            Self::NotFound { what } => write!(f, "{what} not found"),
            Self::SessionNotFound { session } => {
                write!(
                    f,
                    "session '{session}' not found.\n  To fix: it may have been closed or reaped for inactivity; open a new session."
                )
            }
            Self::InvalidPath { path, reason } => {
                write!(f, "invalid path '{path}': {reason}")
            }
            Self::ChainAborted { session, cause } => {
                write!(
                    f,
                    "operation on session {session} was cancelled because an earlier one failed: {cause}\n  To fix: retry the operation."
                )
            }
            Self::Upstream { url, detail } => {
                write!(f, "upstream request to {url} failed: {detail}")
            }
            Self::Invalid { value, reason } => write!(f, "invalid value {value:?}: {reason}"),
            Self::Store(err) => write!(f, "object store error: {err}"),
            Self::Config { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {detail}\n  To fix: edit the config file and correct the issue.",
                    path.display()
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<crate::config::ConfigError> for SyncError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

impl From<crate::model::ValidationError> for SyncError {
    fn from(err: crate::model::ValidationError) -> Self {
        Self::Invalid {
            value: err.value,
            reason: format!("{}: {}", err.kind, err.reason),
        }
    }
}

impl From<treesync_git::RefNameError> for SyncError {
    fn from(err: treesync_git::RefNameError) -> Self {
        Self::Invalid {
            value: err.value,
            reason: err.reason,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(format!("blocking task failed: {err}")))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
