//! Feeds relay events into the replica registry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::ReplicaRegistry;
use crate::event::{SyncEvent, WorkspaceAction};
use crate::relay::EventHandler;

/// [`EventHandler`] that keeps registered replicas in step with upstream.
///
/// Commit events are applied only to replicas that already exist and are
/// ready; anything else is picked up lazily on the next access. Every
/// (re)connect revalidates all replicas, which covers events missed while
/// disconnected.
pub struct ReplicaEventHandler {
    registry: Arc<ReplicaRegistry>,
}

impl ReplicaEventHandler {
    #[must_use]
    pub const fn new(registry: Arc<ReplicaRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for ReplicaEventHandler {
    async fn on_connect(&self, reconnect: bool) {
        info!(reconnect, "event stream connected; revalidating replicas");
        self.registry.revalidate_all().await;
    }

    async fn on_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::Commit(commit) => {
                let Some(replica) = self.registry.get(&commit.repo_slug).await else {
                    debug!(repo = %commit.repo_slug, "commit for a repository with no replica");
                    return;
                };
                if !replica.is_ready() {
                    debug!(repo = %commit.repo_slug, "replica not ready; ignoring commit");
                    return;
                }
                match replica.apply_or_resync(&commit).await {
                    Ok(outcome) => {
                        info!(repo = %commit.repo_slug, oid = %commit.oid.short(), ?outcome, "commit event handled");
                    }
                    Err(e) => warn!(repo = %commit.repo_slug, error = %e, "commit event failed"),
                }
            }
            SyncEvent::Workspace(ws) => match ws.action {
                WorkspaceAction::RepoRemoved => {
                    let Some(slug) = ws.repo_slug else {
                        warn!(workspace = %ws.workspace_id, "repo-removed event without a slug");
                        return;
                    };
                    if let Err(e) = self.registry.clear(&slug).await {
                        warn!(repo = %slug, error = %e, "failed to clear replica");
                    }
                }
                WorkspaceAction::Changed | WorkspaceAction::RepoAdded => {
                    info!(
                        workspace = %ws.workspace_id,
                        action = ?ws.action,
                        repo = ?ws.repo_slug,
                        "workspace event"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreesyncConfig;
    use crate::event::{CommitEvent, WorkspaceEvent};
    use crate::model::RepoSlug;
    use crate::replica::ReplicaState;
    use chrono::Utc;
    use treesync_git::GitOid;

    fn handler(dir: &std::path::Path) -> (ReplicaEventHandler, Arc<ReplicaRegistry>) {
        let toml = format!(
            r#"
            [replica]
            data_dir = "{}"
            [[repos]]
            slug = "acme/docs"
            url = "/nonexistent/upstream.git"
            "#,
            dir.display()
        );
        let registry = Arc::new(ReplicaRegistry::new(TreesyncConfig::parse(&toml).unwrap()));
        (ReplicaEventHandler::new(Arc::clone(&registry)), registry)
    }

    fn docs() -> RepoSlug {
        RepoSlug::new("acme/docs").unwrap()
    }

    fn commit(slug: &str) -> SyncEvent {
        SyncEvent::Commit(CommitEvent {
            repo_slug: RepoSlug::new(slug).unwrap(),
            oid: GitOid::from_bytes([0x11; 20]),
            message: "m".into(),
            author: "A <a@x>".into(),
            timestamp: Utc::now(),
            files: Vec::new(),
            tree: None,
            parent: Vec::new(),
        })
    }

    fn workspace(action: WorkspaceAction, slug: Option<RepoSlug>) -> SyncEvent {
        SyncEvent::Workspace(WorkspaceEvent {
            action,
            workspace_id: "ws-1".into(),
            repo_slug: slug,
            repo_type: None,
        })
    }

    #[tokio::test]
    async fn commit_for_an_unregistered_repository_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, registry) = handler(dir.path());

        handler.on_event(commit("acme/docs")).await;
        handler.on_event(commit("someone/else")).await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn commit_for_a_replica_that_is_not_ready_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, registry) = handler(dir.path());
        let replica = registry.get_or_create(&docs()).await.unwrap();

        handler.on_event(commit("acme/docs")).await;
        assert_eq!(replica.state(), ReplicaState::Uninitialized);
        assert_eq!(replica.cursor(), None);
        assert!(!replica.dir().exists());
    }

    #[tokio::test]
    async fn repo_removed_clears_the_replica() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, registry) = handler(dir.path());
        let replica = registry.get_or_create(&docs()).await.unwrap();
        std::fs::create_dir_all(replica.dir()).unwrap();
        std::fs::write(replica.dir().join("stale.md"), "x").unwrap();

        handler
            .on_event(workspace(WorkspaceAction::RepoRemoved, Some(docs())))
            .await;
        assert!(registry.get(&docs()).await.is_none());
        assert!(!replica.dir().exists());
    }

    #[tokio::test]
    async fn other_workspace_events_leave_replicas_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, registry) = handler(dir.path());
        registry.get_or_create(&docs()).await.unwrap();

        handler.on_event(workspace(WorkspaceAction::RepoRemoved, None)).await;
        handler.on_event(workspace(WorkspaceAction::Changed, Some(docs()))).await;
        handler.on_event(workspace(WorkspaceAction::RepoAdded, Some(docs()))).await;
        assert!(registry.get(&docs()).await.is_some());
    }
}
