//! Commit records as consumers see them.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use treesync_git::{ChangeKind, CommitInfo, GitOid};

/// One path touched by a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

/// An immutable commit as recorded by the object store.
///
/// The id always comes from the store (or from upstream, which computed it
/// with the same store); treesync never derives one itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    #[serde(alias = "sha")]
    pub oid: GitOid,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parents: Vec<GitOid>,
    #[serde(default, alias = "files")]
    pub changes: Vec<FileChange>,
}

impl CommitRecord {
    /// First line of the message.
    #[must_use]
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

impl From<CommitInfo> for CommitRecord {
    fn from(info: CommitInfo) -> Self {
        Self {
            oid: info.oid,
            message: info.message,
            author: info.author,
            timestamp: Utc
                .timestamp_opt(info.timestamp, 0)
                .single()
                .unwrap_or_default(),
            parents: info.parents,
            changes: info
                .changes
                .into_iter()
                .map(|c| FileChange {
                    path: c.path,
                    change_type: c.kind,
                    previous_path: c.previous_path,
                })
                .collect(),
        }
    }
}
