//! Shared helpers for treesync integration tests.
//!
//! Every test builds its own bare upstream in a temp directory; nothing
//! touches the network or the user's git configuration.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use treesync::config::TreesyncConfig;
use treesync::error::{Result, SyncError};
use treesync::event::CommitEvent;
use treesync::model::{CommitRecord, RepoSlug, SessionId};
use treesync::session::{Credential, CredentialProvider};
use treesync_git::{GitOid, GitStore, Identity, ObjectStore, SnapshotFile};

pub const SLUG: &str = "acme/docs";

pub fn slug() -> RepoSlug {
    RepoSlug::new(SLUG).unwrap()
}

pub fn identity() -> Identity {
    Identity {
        name: "Seed Author".into(),
        email: "seed@test.invalid".into(),
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// A bare upstream repository plus a seed clone that authors commits into
/// it, all inside one temp directory.
pub struct Upstream {
    pub dir: TempDir,
    pub bare: PathBuf,
    seed: GitStore,
}

impl Upstream {
    /// An upstream whose `main` already holds one commit with `README.md`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let bare = dir.path().join("upstream.git");
        std::fs::create_dir_all(&bare).unwrap();
        git(&bare, &["init", "--bare", "--quiet", "--initial-branch", "main"]);
        let seed = GitStore::init(&dir.path().join("seed"), "main").unwrap();
        seed.set_remote("origin", bare.to_str().unwrap()).unwrap();
        let upstream = Self { dir, bare, seed };
        upstream.commit(&[("README.md", "# docs\n")], "initial commit");
        upstream
    }

    /// Commit `files` on the seed and push them upstream.
    pub fn commit(&self, files: &[(&str, &str)], message: &str) -> GitOid {
        let files: Vec<SnapshotFile> = files
            .iter()
            .map(|(p, c)| SnapshotFile {
                path: (*p).to_owned(),
                content: c.as_bytes().to_vec(),
            })
            .collect();
        let oid = self
            .seed
            .write_snapshot(&files, message, &identity())
            .unwrap();
        self.seed
            .push(self.seed.root(), "origin", "HEAD:refs/heads/main", &[])
            .unwrap();
        oid
    }

    pub fn url(&self) -> &str {
        self.bare.to_str().unwrap()
    }

    /// Current tip of `main` upstream.
    pub fn head(&self) -> GitOid {
        git(&self.bare, &["rev-parse", "refs/heads/main"])
            .parse()
            .unwrap()
    }

    /// Content of `path` at the upstream tip, if present.
    pub fn file_at_head(&self, path: &str) -> Option<String> {
        let out = Command::new("git")
            .args(["show", &format!("main:{path}")])
            .current_dir(&self.bare)
            .output()
            .unwrap();
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Paths changed by upstream commit `oid`, sorted.
    pub fn changed_paths(&self, oid: GitOid) -> Vec<String> {
        let out = git(
            &self.bare,
            &["diff-tree", "--no-commit-id", "--name-only", "-r", "--root", &oid.to_string()],
        );
        let mut paths: Vec<String> = out.lines().map(str::to_owned).collect();
        paths.sort();
        paths
    }

    pub fn parents(&self, oid: GitOid) -> Vec<GitOid> {
        git(&self.bare, &["rev-list", "--parents", "-n", "1", &oid.to_string()])
            .split_whitespace()
            .skip(1)
            .map(|s| s.parse().unwrap())
            .collect()
    }

    /// The commit event a writer would publish for upstream commit `oid`.
    pub fn event_for(&self, oid: GitOid) -> CommitEvent {
        let info = self.seed.read_commit(oid).unwrap();
        let tree = info.tree;
        CommitEvent::from_record(slug(), &CommitRecord::from(info), Some(tree))
    }

    /// A full (non-shallow) clone for a writer, at `<tmp>/<name>`.
    pub fn writer_clone(&self, name: &str) -> PathBuf {
        let dest = self.dir.path().join(name);
        git(
            self.dir.path(),
            &["clone", "--quiet", self.url(), dest.to_str().unwrap()],
        );
        dest
    }

    /// Configuration with `repos` pointing at this upstream. `writer` is the
    /// local repository sessions branch from, if any.
    pub fn config(&self, root: &Path, writer: Option<&Path>, extra: &str) -> TreesyncConfig {
        let path_line = writer
            .map(|p| format!("path = '{}'\n", p.display()))
            .unwrap_or_default();
        let toml = format!(
            r"
[replica]
data_dir = '{data}'
clone_depth = 20
deepen_by = 10

[session]
workspace_root = '{ws}'
max_concurrent_ops = 2
identity = {{ name = 'Writer', email = 'writer@test.invalid' }}
{extra}

[[repos]]
slug = '{SLUG}'
url = '{url}'
{path_line}",
            data = root.join("replicas").display(),
            ws = root.join("workspaces").display(),
            url = self.url(),
        );
        TreesyncConfig::parse(&toml).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Hands out a dummy credential and counts issue/revoke calls. Pushes to a
/// local bare repository never ask for it.
#[derive(Default)]
pub struct RecordingCredentials {
    pub issued: AtomicUsize,
    pub revoked: AtomicUsize,
    pub refuse: bool,
}

impl RecordingCredentials {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for RecordingCredentials {
    async fn issue(&self, _repo: &RepoSlug, session: &SessionId) -> Result<Credential> {
        if self.refuse {
            return Err(SyncError::Push {
                session: session.clone(),
                detail: "credential service unavailable".into(),
            });
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Credential {
            username: "x-access-token".into(),
            secret: "test-secret".into(),
        })
    }

    async fn revoke(&self, _credential: Credential) -> Result<()> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn recording_credentials() -> Arc<RecordingCredentials> {
    Arc::new(RecordingCredentials::default())
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Poll `check` every 50ms until it returns `true` or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
