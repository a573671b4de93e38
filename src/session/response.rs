//! Terse response contract of the write surface.
//!
//! Success: `{"success": true, "path"?, "bytes_written"?, "pending_files": [..], "hint"}`
//! (plus `session_id` or `oid` where the call produced one).
//! Failure: `{"success": false, "error": "<code>", "message": "..."}`.

use serde::{Deserialize, Serialize};
use treesync_git::GitOid;

use crate::error::SyncError;
use crate::model::SessionId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<GitOid>,
    /// Every pending path of the session, in first-staged order.
    pub pending_files: Vec<String>,
    pub hint: String,
}

impl WriteAck {
    #[must_use]
    pub fn new(pending_files: Vec<String>, hint: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: None,
            path: None,
            bytes_written: None,
            oid: None,
            pending_files,
            hint: hint.into(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>, bytes_written: Option<usize>) -> Self {
        self.path = Some(path.into());
        self.bytes_written = bytes_written;
        self
    }

    #[must_use]
    pub const fn with_oid(mut self, oid: GitOid) -> Self {
        self.oid = Some(oid);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl From<&SyncError> for WriteFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            success: false,
            error: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}

/// Hint after staging.
pub(crate) fn pending_hint(pending: usize, auto_commit_secs: u64) -> String {
    let files = if pending == 1 { "file" } else { "files" };
    format!(
        "{pending} {files} pending; commit to record them (auto-commit in {auto_commit_secs}s)"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ack_is_terse() {
        let pending = vec!["docs/a.md".to_owned(), "notes.md".to_owned()];
        let ack = WriteAck::new(pending, pending_hint(2, 30)).with_path("docs/a.md", Some(12));
        let v = serde_json::to_value(&ack).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "success": true,
                "path": "docs/a.md",
                "bytes_written": 12,
                "pending_files": ["docs/a.md", "notes.md"],
                "hint": "2 files pending; commit to record them (auto-commit in 30s)"
            })
        );
    }

    #[test]
    fn failure_carries_code_and_message() {
        let err = SyncError::EmptyCommit {
            session: SessionId::new("00000000000000ff").unwrap(),
        };
        let v = serde_json::to_value(WriteFailure::from(&err)).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "empty_commit");
        assert!(v["message"].as_str().unwrap().contains("00000000000000ff"));
    }
}
