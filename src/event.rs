//! Sync events: the messages fanned out by the relay.
//!
//! Events carry identifiers (slug, commit id, changed paths), never object
//! payloads. Replicas always fetch the objects themselves, so the ids they
//! end up with are the ones upstream computed.
//!
//! Wire format, one JSON object per line:
//!
//! ```json
//! {"type":"commit","repoSlug":"acme/docs","oid":"…","message":"…","author":"…",
//!  "timestamp":"2024-05-01T10:00:00Z","files":[{"path":"a.md","content":null,"changeType":"modified"}],
//!  "tree":"…","parent":["…"]}
//! {"type":"workspace","action":"repo-added","workspaceId":"w1","repoSlug":"acme/docs","repoType":"docs"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use treesync_git::{ChangeKind, GitOid};

use crate::model::{CommitRecord, RepoSlug};

/// The four event kinds, flattened for matching and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Commit,
    WorkspaceChanged,
    RepoAdded,
    RepoRemoved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncEvent {
    Commit(CommitEvent),
    Workspace(WorkspaceEvent),
}

impl SyncEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Commit(_) => EventKind::Commit,
            Self::Workspace(ev) => match ev.action {
                WorkspaceAction::Changed => EventKind::WorkspaceChanged,
                WorkspaceAction::RepoAdded => EventKind::RepoAdded,
                WorkspaceAction::RepoRemoved => EventKind::RepoRemoved,
            },
        }
    }

    #[must_use]
    pub const fn repo_slug(&self) -> Option<&RepoSlug> {
        match self {
            Self::Commit(ev) => Some(&ev.repo_slug),
            Self::Workspace(ev) => ev.repo_slug.as_ref(),
        }
    }

    /// Serialize as one NDJSON line (without the trailing newline).
    ///
    /// # Errors
    /// Fails only if serialization itself fails.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one NDJSON line.
    ///
    /// # Errors
    /// Returns the serde error for malformed or unknown events.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A new commit on a repository's tracked branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub repo_slug: RepoSlug,
    pub oid: GitOid,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<EventFile>,
    #[serde(default)]
    pub tree: Option<GitOid>,
    #[serde(default)]
    pub parent: Vec<GitOid>,
}

/// A path touched by a commit. `content` is always `null` from treesync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    pub change_type: ChangeKind,
}

impl CommitEvent {
    /// Build the event for a commit the store just recorded.
    #[must_use]
    pub fn from_record(repo_slug: RepoSlug, record: &CommitRecord, tree: Option<GitOid>) -> Self {
        Self {
            repo_slug,
            oid: record.oid,
            message: record.message.clone(),
            author: record.author.clone(),
            timestamp: record.timestamp,
            files: record
                .changes
                .iter()
                .map(|c| EventFile {
                    path: c.path.clone(),
                    content: None,
                    change_type: c.change_type,
                })
                .collect(),
            tree,
            parent: record.parents.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceAction {
    Changed,
    RepoAdded,
    RepoRemoved,
}

/// A change to a workspace: its set of repositories, or a write session
/// opening or closing in it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEvent {
    pub action: WorkspaceAction,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_slug: Option<RepoSlug>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_type: Option<String>,
}

impl WorkspaceEvent {
    #[must_use]
    pub fn changed(workspace_id: impl Into<String>, repo_slug: Option<RepoSlug>) -> Self {
        Self {
            action: WorkspaceAction::Changed,
            workspace_id: workspace_id.into(),
            repo_slug,
            repo_type: None,
        }
    }
}
