//! The upstream hosting API: bulk snapshots and extended history.
//!
//! | Request                                   | Response                          |
//! |-------------------------------------------|-----------------------------------|
//! | `GET /repo-bootstrap?repo=<slug>`         | `{files: [{path, content}], headCommit}` |
//! | `GET /repo-history?repo=<slug>`           | `{commits: [...]}`                |
//! | `GET /repo-history?repo=<slug>&path=&sha=`| `{content}`                       |

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use treesync_git::{GitOid, SnapshotFile};

use crate::error::{Result, SyncError};
use crate::model::{CommitRecord, RepoSlug};

/// A full file tree of one repository, used when cloning is impossible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSnapshot {
    pub files: Vec<SnapshotEntry>,
    #[serde(default)]
    pub head_commit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub content: String,
}

impl RepoSnapshot {
    #[must_use]
    pub fn to_store_files(&self) -> Vec<SnapshotFile> {
        self.files
            .iter()
            .map(|f| SnapshotFile {
                path: f.path.clone(),
                content: f.content.clone().into_bytes(),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    commits: Vec<CommitRecord>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: Option<String>,
}

/// Source of the bulk snapshot used by the bootstrap fallback.
#[async_trait]
pub trait BootstrapSource: Send + Sync {
    async fn snapshot(&self, repo: &RepoSlug) -> Result<RepoSnapshot>;
}

/// Source of history beyond what a shallow replica holds.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(&self, repo: &RepoSlug) -> Result<Vec<CommitRecord>>;
}

/// [`BootstrapSource`] and [`HistorySource`] over HTTP.
#[derive(Clone)]
pub struct HttpUpstream {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Upstream {
                url: base_url.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        route: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}/{route}", self.base_url);
        let upstream = |e: reqwest::Error| SyncError::Upstream {
            url: url.clone(),
            detail: e.to_string(),
        };
        debug!(%url, "upstream request");
        self.http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .map_err(upstream)
    }

    /// Content of `path` at commit `sha`, as upstream stores it.
    ///
    /// # Errors
    /// [`SyncError::NotFound`] when upstream has no such file, or
    /// [`SyncError::Upstream`] on transport failure.
    #[instrument(skip(self), fields(repo = %repo))]
    pub async fn content_at(&self, repo: &RepoSlug, path: &str, sha: GitOid) -> Result<String> {
        let sha = sha.to_string();
        let body: ContentResponse = self
            .get_json(
                "repo-history",
                &[("repo", repo.as_str()), ("path", path), ("sha", &sha)],
            )
            .await?;
        body.content.ok_or_else(|| SyncError::NotFound {
            what: format!("'{path}' at {sha} upstream"),
        })
    }
}

#[async_trait]
impl BootstrapSource for HttpUpstream {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn snapshot(&self, repo: &RepoSlug) -> Result<RepoSnapshot> {
        self.get_json("repo-bootstrap", &[("repo", repo.as_str())])
            .await
    }
}

#[async_trait]
impl HistorySource for HttpUpstream {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn history(&self, repo: &RepoSlug) -> Result<Vec<CommitRecord>> {
        let body: HistoryResponse = self
            .get_json("repo-history", &[("repo", repo.as_str())])
            .await?;
        Ok(body.commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn slug() -> RepoSlug {
        RepoSlug::new("acme/docs").unwrap()
    }

    #[tokio::test]
    async fn snapshot_and_history_are_parsed() {
        let sha = "ab".repeat(20);
        let commit = serde_json::json!({
            "sha": sha,
            "message": "edit",
            "author": "A <a@x>",
            "timestamp": "2024-05-01T10:00:00Z",
            "files": [{"path": "a.md", "changeType": "modified"}]
        });
        let app = Router::new()
            .route(
                "/repo-bootstrap",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("repo").map(String::as_str), Some("acme/docs"));
                    Json(serde_json::json!({
                        "files": [{"path": "a.md", "content": "hello"}],
                        "headCommit": "deadbeef"
                    }))
                }),
            )
            .route(
                "/repo-history",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let commit = commit.clone();
                    async move {
                        if q.contains_key("path") {
                            Json(serde_json::json!({ "content": "old text" }))
                        } else {
                            Json(serde_json::json!({ "commits": [commit] }))
                        }
                    }
                }),
            );
        let base = spawn(app).await;
        let upstream = HttpUpstream::new(&base, Duration::from_secs(5)).unwrap();

        let snap = upstream.snapshot(&slug()).await.unwrap();
        assert_eq!(snap.head_commit.as_deref(), Some("deadbeef"));
        assert_eq!(snap.to_store_files()[0].content, b"hello");

        let history = upstream.history(&slug()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].oid.to_string(), sha);
        assert_eq!(history[0].changes[0].path, "a.md");

        let text = upstream
            .content_at(&slug(), "a.md", sha.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(text, "old text");
    }

    #[tokio::test]
    async fn http_errors_become_upstream_errors() {
        let base = spawn(Router::new()).await;
        let upstream = HttpUpstream::new(&base, Duration::from_secs(5)).unwrap();
        let err = upstream.snapshot(&slug()).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream { .. }), "{err}");
    }
}
