//! Replica engine against a real bare upstream.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{Upstream, git, slug};
use tempfile::TempDir;
use treesync::error::{Result, SyncError};
use treesync::model::{CommitRecord, RepoSlug};
use treesync::replica::{
    ApplyOutcome, BootstrapSource, HistorySource, Replica, ReplicaRegistry, ReplicaSettings,
    ReplicaState, RepoSnapshot,
};
use treesync::replica::upstream::SnapshotEntry;

async fn replica(upstream: &Upstream, root: &TempDir) -> Arc<Replica> {
    shallow_replica(upstream, root, 20).await
}

async fn shallow_replica(upstream: &Upstream, root: &TempDir, depth: u32) -> Arc<Replica> {
    let config = upstream.config(root.path(), None, "");
    let mut settings = ReplicaSettings::from_config(&config, &config.repos[0]);
    settings.clone_depth = depth;
    Replica::open(settings).await
}

fn text(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn bootstrap_sets_cursor_to_upstream_head() {
    let upstream = Upstream::new();
    let head = upstream.commit(&[("a.md", "one\n")], "add a");
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;

    assert_eq!(replica.state(), ReplicaState::Uninitialized);
    let cursor = replica.ensure_ready(None).await.unwrap();
    assert_eq!(cursor, head);
    assert!(replica.is_ready());
    assert!(!replica.is_synthetic());
    assert_eq!(text(&replica.read_object_at("a.md", None).await.unwrap()), "one\n");
}

#[tokio::test]
async fn applying_an_event_moves_head_and_serves_its_files() {
    let upstream = Upstream::new();
    let c1 = upstream.commit(&[("doc.md", "v1\n")], "v1");
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    assert_eq!(replica.ensure_ready(None).await.unwrap(), c1);

    let c2 = upstream.commit(&[("doc.md", "v2\n"), ("notes.md", "n\n")], "v2");
    let event = upstream.event_for(c2);
    assert_eq!(event.parent, vec![c1]);

    assert_eq!(replica.apply_commit(&event).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(replica.cursor(), Some(c2));
    for file in &event.files {
        let expected = upstream.file_at_head(&file.path).unwrap();
        let got = replica.read_object_at(&file.path, Some(c2)).await.unwrap();
        assert_eq!(text(&got), expected, "{}", file.path);
    }
    // The working tree follows the cursor.
    let on_disk = std::fs::read_to_string(replica.dir().join("doc.md")).unwrap();
    assert_eq!(on_disk, "v2\n");
}

#[tokio::test]
async fn reapplying_is_a_noop() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let c2 = upstream.commit(&[("a.md", "x\n")], "x");
    let event = upstream.event_for(c2);
    replica.apply_commit(&event).await.unwrap();
    assert_eq!(replica.apply_commit(&event).await.unwrap(), ApplyOutcome::NoOp);
    assert_eq!(replica.cursor(), Some(c2));
}

#[tokio::test]
async fn concurrent_applies_of_one_commit_converge() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let c2 = upstream.commit(&[("a.md", "x\n")], "x");
    let event = upstream.event_for(c2);
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let replica = Arc::clone(&replica);
            let event = event.clone();
            tokio::spawn(async move { replica.apply_commit(&event).await })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(
            matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::NoOp),
            "{outcome:?}"
        );
    }
    assert_eq!(replica.cursor(), Some(c2));
    assert_eq!(replica.state(), ReplicaState::Ready);
}

#[tokio::test]
async fn stale_event_never_moves_the_cursor_back() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let c2 = upstream.commit(&[("a.md", "2\n")], "2");
    let c3 = upstream.commit(&[("a.md", "3\n")], "3");
    let (e2, e3) = (upstream.event_for(c2), upstream.event_for(c3));

    // Delivered out of order.
    assert_eq!(replica.apply_commit(&e3).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(replica.apply_commit(&e2).await.unwrap(), ApplyOutcome::NoOp);
    assert_eq!(replica.cursor(), Some(c3));
    assert_eq!(text(&replica.read_object_at("a.md", None).await.unwrap()), "3\n");
}

#[tokio::test]
async fn event_for_another_repo_is_rejected() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let mut event = upstream.event_for(upstream.head());
    event.repo_slug = RepoSlug::new("acme/other").unwrap();
    let err = replica.apply_commit(&event).await.unwrap_err();
    assert!(matches!(err, SyncError::Invalid { .. }), "{err}");
}

#[tokio::test]
async fn revalidate_catches_up_on_missed_events() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    assert_eq!(replica.revalidate().await.unwrap(), Some(ApplyOutcome::NoOp));

    upstream.commit(&[("a.md", "1\n")], "1");
    let head = upstream.commit(&[("b.md", "2\n")], "2");
    assert_eq!(replica.revalidate().await.unwrap(), Some(ApplyOutcome::Applied));
    assert_eq!(replica.cursor(), Some(head));
}

#[tokio::test]
async fn revalidate_without_a_copy_does_nothing() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    assert_eq!(replica.revalidate().await.unwrap(), None);
    assert_eq!(replica.state(), ReplicaState::Uninitialized);
}

#[tokio::test]
async fn failed_fetch_falls_back_to_a_full_resync() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    // The replica's own remote breaks; its configured URL still works.
    git(
        replica.dir(),
        &["remote", "set-url", "origin", "/nonexistent/upstream.git"],
    );
    let head = upstream.commit(&[("a.md", "new\n")], "new");
    let event = upstream.event_for(head);

    let err = replica.apply_commit(&event).await.unwrap_err();
    assert!(matches!(err, SyncError::ApplyCommit { .. }), "{err}");
    assert_ne!(replica.cursor(), Some(head));

    assert_eq!(replica.apply_or_resync(&event).await.unwrap(), ApplyOutcome::Resynced);
    assert!(replica.is_ready());
    assert_eq!(replica.cursor(), Some(upstream.head()));
    assert_eq!(text(&replica.read_object_at("a.md", None).await.unwrap()), "new\n");
}

#[tokio::test]
async fn failed_bootstrap_keeps_the_previous_copy() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let config = upstream.config(root.path(), None, "");
    let settings = ReplicaSettings::from_config(&config, &config.repos[0]);
    let replica = Replica::open(settings.clone()).await;
    let head = replica.ensure_ready(None).await.unwrap();

    let mut broken = settings;
    broken.url = "/nonexistent/upstream.git".into();
    let broken = Replica::open(broken).await;
    assert_eq!(broken.cursor(), Some(head));

    let err = broken.bootstrap().await.unwrap_err();
    assert!(matches!(err, SyncError::Bootstrap { .. }), "{err}");
    assert!(broken.is_ready());
    assert_eq!(broken.cursor(), Some(head));
    assert!(broken.read_object_at("README.md", None).await.is_ok());
}

#[tokio::test]
async fn shallow_reads_deepen_once() {
    let upstream = Upstream::new();
    let old = upstream.commit(&[("old.md", "old\n")], "old");
    for n in 0..3 {
        upstream.commit(&[("n.md", &format!("{n}\n"))], "n");
    }
    let root = TempDir::new().unwrap();
    let replica = shallow_replica(&upstream, &root, 1).await;
    replica.ensure_ready(None).await.unwrap();

    let got = replica.read_object_at("old.md", Some(old)).await.unwrap();
    assert_eq!(text(&got), "old\n");
    let meta = replica.read_commit_meta(old).await.unwrap();
    assert_eq!(meta.summary(), "old");
    assert_eq!(meta.changes.len(), 1);
    assert_eq!(meta.changes[0].path, "old.md");
}

#[tokio::test]
async fn missing_path_is_not_found() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let err = replica.read_object_at("nope.md", None).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn history_is_newest_first() {
    let upstream = Upstream::new();
    let a = upstream.commit(&[("a.md", "a\n")], "a");
    let b = upstream.commit(&[("b.md", "b\n")], "b");
    let root = TempDir::new().unwrap();
    let replica = replica(&upstream, &root).await;
    replica.ensure_ready(None).await.unwrap();

    let history = replica.history(2).await.unwrap();
    let ids: Vec<_> = history.iter().map(|c| c.oid).collect();
    assert_eq!(ids, vec![b, a]);
}

#[tokio::test]
async fn cursor_survives_reopening() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let config = upstream.config(root.path(), None, "");
    let settings = ReplicaSettings::from_config(&config, &config.repos[0]);

    let first = Replica::open(settings.clone()).await;
    let head = first.ensure_ready(None).await.unwrap();
    drop(first);

    let again = Replica::open(settings).await;
    assert!(again.is_ready());
    assert_eq!(again.cursor(), Some(head));
}

// ---------------------------------------------------------------------------
// Snapshot fallback
// ---------------------------------------------------------------------------

struct FixedSnapshot;

#[async_trait]
impl BootstrapSource for FixedSnapshot {
    async fn snapshot(&self, _repo: &RepoSlug) -> Result<RepoSnapshot> {
        Ok(RepoSnapshot {
            files: vec![SnapshotEntry {
                path: "guide/intro.md".into(),
                content: "from snapshot\n".into(),
            }],
            head_commit: None,
        })
    }
}

#[tokio::test]
async fn unreachable_upstream_falls_back_to_snapshot_then_resyncs() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let config = upstream.config(root.path(), None, "");
    let mut settings = ReplicaSettings::from_config(&config, &config.repos[0]);
    let late = root.path().join("late.git");
    settings.url = late.to_str().unwrap().to_owned();
    let replica = Replica::open(settings).await;

    replica
        .ensure_ready(Some(&FixedSnapshot as &dyn BootstrapSource))
        .await
        .unwrap();
    assert!(replica.is_ready());
    assert!(replica.is_synthetic());
    let got = replica.read_object_at("guide/intro.md", None).await.unwrap();
    assert_eq!(text(&got), "from snapshot\n");

    // Snapshot history is synthetic: events cannot be applied to it.
    let event = upstream.event_for(upstream.head());
    let err = replica.apply_commit(&event).await.unwrap_err();
    assert!(matches!(err, SyncError::ApplyCommit { .. }), "{err}");

    // Once the upstream is reachable, revalidation rebuilds from a clone.
    git(
        root.path(),
        &["clone", "--bare", "--quiet", upstream.url(), late.to_str().unwrap()],
    );
    assert_eq!(replica.revalidate().await.unwrap(), Some(ApplyOutcome::Resynced));
    assert!(!replica.is_synthetic());
    assert_eq!(replica.cursor(), Some(upstream.head()));
}

// ---------------------------------------------------------------------------
// Extended history
// ---------------------------------------------------------------------------

struct CannedHistory(Vec<CommitRecord>);

#[async_trait]
impl HistorySource for CannedHistory {
    async fn history(&self, _repo: &RepoSlug) -> Result<Vec<CommitRecord>> {
        Ok(self.0.clone())
    }
}

struct DownHistory;

#[async_trait]
impl HistorySource for DownHistory {
    async fn history(&self, _repo: &RepoSlug) -> Result<Vec<CommitRecord>> {
        Err(SyncError::Upstream {
            url: "http://history.invalid".into(),
            detail: "connection refused".into(),
        })
    }
}

/// Metadata for every upstream commit, read from a complete clone.
async fn upstream_truth(upstream: &Upstream, root: &TempDir) -> Vec<CommitRecord> {
    let full = shallow_replica(upstream, root, 1000).await;
    full.ensure_ready(None).await.unwrap();
    let mut records = Vec::new();
    for line in git(&upstream.bare, &["rev-list", "main"]).lines() {
        records.push(full.read_commit_meta(line.parse().unwrap()).await.unwrap());
    }
    records
}

#[tokio::test]
async fn full_history_merges_upstream_beyond_the_shallow_edge() {
    let upstream = Upstream::new();
    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(upstream.commit(&[("n.md", &format!("{n}\n"))], &format!("c{n}")));
    }
    let truth_root = TempDir::new().unwrap();
    let truth = upstream_truth(&upstream, &truth_root).await;
    assert_eq!(truth.len(), 5);

    let root = TempDir::new().unwrap();
    let config = upstream.config(root.path(), None, "");
    let mut settings = ReplicaSettings::from_config(&config, &config.repos[0]);
    settings.clone_depth = 2;
    settings.deepen_by = 1;
    let replica = Replica::open(settings).await;
    replica.ensure_ready(None).await.unwrap();

    // Two commits deep, the older one on the boundary: the walk deepens by
    // one and lists only commits whose parents are local.
    let local = replica.history(100).await.unwrap();
    let local_ids: Vec<_> = local.iter().map(|c| c.oid).collect();
    assert_eq!(local_ids, vec![ids[3], ids[2]]);
    assert_eq!(local[0].parents, vec![ids[2]]);
    assert_eq!(local[1].parents, vec![ids[1]]);

    let full = replica
        .full_history(&CannedHistory(truth.clone()))
        .await
        .unwrap();
    assert_eq!(full.len(), truth.len());
    for record in &full {
        let expected = truth.iter().find(|t| t.oid == record.oid).unwrap();
        assert_eq!(record, expected);
    }
    for pair in full.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }

    let degraded = replica.full_history(&DownHistory).await.unwrap();
    assert!(!degraded.is_empty());
    for record in &degraded {
        let expected = truth.iter().find(|t| t.oid == record.oid).unwrap();
        assert_eq!(record, expected);
    }
}

#[tokio::test]
async fn boundary_commit_metadata_names_its_real_parent() {
    let upstream = Upstream::new();
    let previous = upstream.commit(&[("f1.md", "1\n")], "one");
    let head = upstream.commit(&[("f2.md", "2\n")], "two");
    let root = TempDir::new().unwrap();
    let replica = shallow_replica(&upstream, &root, 1).await;
    assert_eq!(replica.ensure_ready(None).await.unwrap(), head);

    let meta = replica.read_commit_meta(head).await.unwrap();
    assert_eq!(meta.parents, vec![previous]);
    let paths: Vec<_> = meta.changes.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["f2.md"]);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registry_clear_removes_the_local_copy() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let registry = ReplicaRegistry::new(upstream.config(root.path(), None, ""));

    let replica = registry.get_or_create(&slug()).await.unwrap();
    replica.ensure_ready(None).await.unwrap();
    let dir = replica.dir().to_path_buf();
    assert!(dir.exists());

    assert!(registry.clear(&slug()).await.unwrap());
    assert!(!dir.exists());
    assert!(registry.get(&slug()).await.is_none());
    assert!(!registry.clear(&slug()).await.unwrap());
}

#[tokio::test]
async fn registry_refuses_unconfigured_repos() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let registry = ReplicaRegistry::new(upstream.config(root.path(), None, ""));
    let err = registry
        .get_or_create(&RepoSlug::new("acme/unknown").unwrap())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::NotFound { .. }), "{err}");
}
