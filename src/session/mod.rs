//! Write-session manager.
//!
//! A writer opens a session on a repository and gets a private git
//! worktree on its own branch (`treesync/<principal>/<session-id>`). Writes
//! are staged into that worktree, recorded by an explicit commit (or a
//! debounced auto-commit) and pushed to the tracked branch upstream.
//!
//! ```text
//! open ──▶ Open ──stage──▶ Dirty ──commit──▶ Committing ──▶ Open
//!           │                │
//!           └──────close─────┴──▶ Closed
//! ```
//!
//! At most one live session exists per principal and repository. Every git
//! process goes through the shared [`ExecutionScheduler`]; each session's
//! operations are sequenced by its own [`OpChain`].

pub mod credentials;
pub mod http;
pub mod response;
pub mod scheduler;
pub mod timer;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use treesync_git::{FetchDepth, GitOid, GitStore, ObjectStore, RefName, StoreError};

use crate::config::{RepoEntry, SessionConfig, TreesyncConfig};
use crate::error::{Result, SyncError};
use crate::event::{CommitEvent, SyncEvent, WorkspaceEvent};
use crate::model::{CommitRecord, PrincipalId, RepoSlug, SessionId};
use crate::relay::EventPublisher;

pub use credentials::{AskpassHelper, Credential, CredentialProvider, StaticTokenProvider};
pub use response::{WriteAck, WriteFailure};
pub use scheduler::{ExecutionScheduler, ExecutionSlot, OpChain};
pub use timer::DebouncedTask;

use response::pending_hint;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Dirty,
    Committing,
    Closed,
}

/// Snapshot of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub principal: PrincipalId,
    pub repo: RepoSlug,
    pub workspace: PathBuf,
    pub branch: String,
    pub state: SessionState,
    /// Staged paths in first-staged order.
    pub pending: Vec<String>,
    /// Tip of the session branch.
    pub head: GitOid,
    pub last_activity_at: DateTime<Utc>,
}

struct Session {
    id: SessionId,
    principal: PrincipalId,
    repo: RepoSlug,
    workspace: PathBuf,
    branch: String,
    tracked: String,
    remote: String,
    store: Arc<dyn ObjectStore>,
    core: Mutex<SessionCore>,
    chain: OpChain,
    auto_commit: DebouncedTask,
}

struct SessionCore {
    state: SessionState,
    pending: Vec<String>,
    head: GitOid,
    pushed: GitOid,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
}

impl SessionCore {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

impl Session {
    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self) -> SessionInfo {
        let core = self.core();
        SessionInfo {
            id: self.id.clone(),
            principal: self.principal.clone(),
            repo: self.repo.clone(),
            workspace: self.workspace.clone(),
            branch: self.branch.clone(),
            state: core.state,
            pending: core.pending.clone(),
            head: core.head,
            last_activity_at: core.last_activity_at,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core().state == SessionState::Closed {
            return Err(SyncError::SessionNotFound {
                session: self.id.to_string(),
            });
        }
        Ok(())
    }

    fn pending(&self) -> Vec<String> {
        self.core().pending.clone()
    }
}

type OwnerKey = (PrincipalId, RepoSlug);

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// `None` while an open for that owner is in progress.
    owners: HashMap<OwnerKey, Option<SessionId>>,
}

/// Holds an owner slot while a session is being opened. Dropping it without
/// [`complete`](Self::complete) frees the slot again.
struct Reservation<'a> {
    table: &'a Mutex<SessionTable>,
    key: Option<OwnerKey>,
}

impl Reservation<'_> {
    fn complete(mut self, session: Arc<Session>) {
        if let Some(key) = self.key.take() {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.owners.insert(key, Some(session.id.clone()));
            table.sessions.insert(session.id.clone(), session);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .owners
                .remove(&key);
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns every write session of this process. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    repos: Vec<RepoEntry>,
    workspace_root: PathBuf,
    scheduler: ExecutionScheduler,
    credentials: Arc<dyn CredentialProvider>,
    publisher: Arc<dyn EventPublisher>,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    /// # Errors
    /// Fails if the workspace root cannot be made absolute.
    pub fn new(
        config: &TreesyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let workspace_root = std::path::absolute(&config.session.workspace_root)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.session.clone(),
                repos: config.repos.clone(),
                workspace_root,
                scheduler: ExecutionScheduler::new(config.session.max_concurrent_ops),
                credentials,
                publisher,
                table: Mutex::new(SessionTable::default()),
            }),
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.inner.scheduler
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.table()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::SessionNotFound {
                session: id.to_string(),
            })
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    /// [`SyncError::SessionNotFound`] if there is no such live session.
    pub fn info(&self, id: &SessionId) -> Result<SessionInfo> {
        Ok(self.session(id)?.info())
    }

    /// Live sessions, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.table().sessions.values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Live session of `principal` on `repo`, if any.
    #[must_use]
    pub fn active_session(&self, principal: &PrincipalId, repo: &RepoSlug) -> Option<SessionId> {
        self.table()
            .owners
            .get(&(principal.clone(), repo.clone()))
            .cloned()
            .flatten()
    }

    fn reserve(&self, principal: &PrincipalId, repo: &RepoSlug) -> Result<Reservation<'_>> {
        let key = (principal.clone(), repo.clone());
        let mut table = self.table();
        if let Some(existing) = table.owners.get(&key) {
            return Err(SyncError::SessionConflict {
                principal: principal.clone(),
                repo: repo.clone(),
                existing: existing.clone(),
            });
        }
        table.owners.insert(key.clone(), None);
        drop(table);
        Ok(Reservation {
            table: &self.inner.table,
            key: Some(key),
        })
    }

    fn forget(&self, session: &Session) {
        let mut table = self.table();
        table.sessions.remove(&session.id);
        let key = (session.principal.clone(), session.repo.clone());
        if table.owners.get(&key) == Some(&Some(session.id.clone())) {
            table.owners.remove(&key);
        }
    }

    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    /// Open a session for `principal` on `repo`.
    ///
    /// The tracked branch is fetched first; if that fails the last known
    /// head is used. The session's worktree branches off that head.
    ///
    /// # Errors
    /// [`SyncError::SessionConflict`] if the principal already has a live
    /// (or opening) session on `repo`; store errors creating the worktree.
    #[instrument(skip(self), fields(principal = %principal, repo = %repo))]
    pub async fn open(&self, principal: &PrincipalId, repo: &RepoSlug) -> Result<WriteAck> {
        let session = self.open_session(principal, repo).await?;
        let head = session.core().head;
        Ok(WriteAck::new(Vec::new(), "session open; stage files, then commit")
            .with_session(session.id.clone())
            .with_oid(head))
    }

    async fn open_session(
        &self,
        principal: &PrincipalId,
        repo: &RepoSlug,
    ) -> Result<Arc<Session>> {
        let reservation = self.reserve(principal, repo)?;

        let entry = self
            .inner
            .repos
            .iter()
            .find(|r| &r.slug == repo)
            .ok_or_else(|| SyncError::NotFound {
                what: format!("repository '{repo}' in the configuration"),
            })?;
        let main = entry.path.clone().ok_or_else(|| SyncError::Invalid {
            value: repo.to_string(),
            reason: "repository has no writer `path` configured".to_owned(),
        })?;
        let tracked = entry
            .branch
            .clone()
            .unwrap_or_else(|| self.inner.config.branch.clone());
        let remote = self.inner.config.remote.clone();
        let store: Arc<dyn ObjectStore> = Arc::new(GitStore::open(&main)?);

        let fetched = {
            let (store, remote, tracked) = (Arc::clone(&store), remote.clone(), tracked.clone());
            self.inner
                .scheduler
                .run_blocking(move || Ok(store.fetch(&remote, &tracked, FetchDepth::Missing)?))
                .await
        };
        if let Err(e) = fetched {
            warn!(error = %e, "fetch before open failed; branching from the last known head");
        }

        let base = {
            let (store, remote, tracked) = (Arc::clone(&store), remote.clone(), tracked.clone());
            self.inner
                .scheduler
                .run_blocking(move || {
                    let upstream = RefName::new(&format!("refs/remotes/{remote}/{tracked}"))?;
                    if let Some(oid) = store.read_ref(&upstream)? {
                        return Ok(oid);
                    }
                    store
                        .read_ref(&RefName::branch(&tracked)?)?
                        .ok_or_else(|| SyncError::NotFound {
                            what: format!("branch '{tracked}'"),
                        })
                })
                .await?
        };

        let id = SessionId::random();
        let branch = format!("treesync/{principal}/{id}");
        let workspace = self
            .inner
            .workspace_root
            .join(repo.rel_path())
            .join(id.as_str());
        {
            let (store, workspace, branch) = (Arc::clone(&store), workspace.clone(), branch.clone());
            self.inner
                .scheduler
                .run_blocking(move || {
                    if let Some(parent) = workspace.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    Ok(store.worktree_add(&workspace, &branch, base)?)
                })
                .await?;
        }

        let now = Instant::now();
        let session = Arc::new(Session {
            id: id.clone(),
            principal: principal.clone(),
            repo: repo.clone(),
            workspace,
            branch,
            tracked,
            remote,
            store,
            core: Mutex::new(SessionCore {
                state: SessionState::Open,
                pending: Vec::new(),
                head: base,
                pushed: base,
                last_activity: now,
                last_activity_at: Utc::now(),
            }),
            chain: OpChain::new(id.clone()),
            auto_commit: DebouncedTask::new(self.inner.config.auto_commit_delay()),
        });
        reservation.complete(Arc::clone(&session));
        info!(session = %id, branch = %session.branch, base = %base.short(), "session opened");
        self.publish_workspace(&session).await;
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Stage
    // -----------------------------------------------------------------------

    /// Write (`Some`) or delete (`None`) `path` in the session's workspace
    /// and mark it pending. Staging the same path again overwrites it.
    ///
    /// # Errors
    /// [`SyncError::InvalidPath`] for paths outside the workspace,
    /// [`SyncError::SessionNotFound`], or I/O errors.
    #[instrument(skip(self, contents), fields(session = %id))]
    pub async fn stage(
        &self,
        id: &SessionId,
        path: &str,
        contents: Option<String>,
    ) -> Result<WriteAck> {
        let session = self.session(id)?;
        let rel = workspace_path(path)?;
        let auto_secs = self.inner.config.auto_commit_delay().as_secs();

        let ack = session
            .chain
            .run(|| async {
                session.ensure_open()?;
                let target = session.workspace.join(&rel);
                refuse_symlinks(&session.workspace, &rel).await?;
                let written = match &contents {
                    Some(text) => {
                        if let Some(parent) = target.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        tokio::fs::write(&target, text).await?;
                        Some(text.len())
                    }
                    None => {
                        if let Err(e) = tokio::fs::remove_file(&target).await
                            && e.kind() != std::io::ErrorKind::NotFound
                        {
                            return Err(e.into());
                        }
                        None
                    }
                };
                let pending = {
                    let mut core = session.core();
                    if !core.pending.contains(&rel) {
                        core.pending.push(rel.clone());
                    }
                    core.state = SessionState::Dirty;
                    core.touch();
                    core.pending.clone()
                };
                debug!(path = %rel, pending = pending.len(), "staged");
                let hint = pending_hint(pending.len(), auto_secs);
                Ok(WriteAck::new(pending, hint)
                    .with_path(rel.clone(), written))
            })
            .await?;

        self.schedule_auto_commit(&session);
        Ok(ack)
    }

    /// Stage into the principal's live session on `repo`, opening one first
    /// if there is none.
    ///
    /// # Errors
    /// As [`open`](Self::open) and [`stage`](Self::stage).
    pub async fn stage_as(
        &self,
        principal: &PrincipalId,
        repo: &RepoSlug,
        path: &str,
        contents: Option<String>,
    ) -> Result<WriteAck> {
        let id = match self.active_session(principal, repo) {
            Some(id) => id,
            None => self.open_session(principal, repo).await?.id.clone(),
        };
        let ack = self.stage(&id, path, contents).await?;
        Ok(ack.with_session(id))
    }

    // -----------------------------------------------------------------------
    // Commit & push
    // -----------------------------------------------------------------------

    /// Record exactly the pending paths as one commit on the session branch.
    ///
    /// # Errors
    /// [`SyncError::EmptyCommit`] if nothing is pending; store errors.
    #[instrument(skip(self, message), fields(session = %id))]
    pub async fn commit(&self, id: &SessionId, message: &str) -> Result<WriteAck> {
        let session = self.session(id)?;
        let oid = session
            .chain
            .run(|| self.commit_in_chain(&session, message))
            .await?;
        Ok(WriteAck::new(Vec::new(), format!("committed {}; push to publish it", oid.short())).with_oid(oid))
    }

    async fn commit_in_chain(&self, session: &Session, message: &str) -> Result<GitOid> {
        session.ensure_open()?;
        let paths = {
            let mut core = session.core();
            if core.pending.is_empty() {
                return Err(SyncError::EmptyCommit {
                    session: session.id.clone(),
                });
            }
            core.state = SessionState::Committing;
            core.pending.clone()
        };
        let message = if message.trim().is_empty() {
            generated_message(&session.principal, paths.len())
        } else {
            message.to_owned()
        };

        let store = Arc::clone(&session.store);
        let workspace = session.workspace.clone();
        let identity = self.inner.config.identity.clone();
        let committed = self
            .inner
            .scheduler
            .run_blocking(move || Ok(store.commit_paths(&workspace, &paths, &message, &identity)?))
            .await;

        let mut core = session.core();
        match committed {
            Ok(oid) => {
                core.pending.clear();
                core.state = SessionState::Open;
                core.head = oid;
                core.touch();
                drop(core);
                session.auto_commit.cancel();
                info!(session = %session.id, oid = %oid.short(), "committed");
                Ok(oid)
            }
            Err(e) => {
                core.state = SessionState::Dirty;
                Err(e)
            }
        }
    }

    /// Push the session branch to the tracked branch upstream and announce
    /// the new head.
    ///
    /// # Errors
    /// [`SyncError::Push`] if the credential cannot be issued or the remote
    /// rejects the push.
    #[instrument(skip(self), fields(session = %id))]
    pub async fn push(&self, id: &SessionId) -> Result<WriteAck> {
        let session = self.session(id)?;
        let pushed = session.chain.run(|| self.push_in_chain(&session)).await?;
        let pending = session.pending();
        Ok(match pushed {
            Some(oid) => WriteAck::new(
                pending,
                format!("pushed {} to {}", oid.short(), session.tracked),
            )
            .with_oid(oid),
            None => WriteAck::new(pending, "nothing new to push"),
        })
    }

    async fn push_in_chain(&self, session: &Session) -> Result<Option<GitOid>> {
        session.ensure_open()?;
        {
            let core = session.core();
            if core.head == core.pushed {
                return Ok(None);
            }
        }

        let credential = self
            .inner
            .credentials
            .issue(&session.repo, &session.id)
            .await?;
        let attempt = self.push_with(session, &credential).await;
        if let Err(e) = self.inner.credentials.revoke(credential).await {
            warn!(session = %session.id, error = %e, "failed to revoke push credential");
        }
        let head = attempt?;

        {
            let mut core = session.core();
            core.pushed = head;
            core.touch();
        }
        info!(session = %session.id, oid = %head.short(), branch = %session.tracked, "pushed");
        self.publish_commit(session, head).await;
        Ok(Some(head))
    }

    /// Push the session head. When the tracked branch moved on upstream,
    /// fetch it, replay the session commits on top and push once more.
    /// Returns the head that reached the remote.
    async fn push_with(&self, session: &Session, credential: &Credential) -> Result<GitOid> {
        let head = session.core().head;
        match self.push_once(session, credential).await? {
            Ok(()) => return Ok(head),
            Err(StoreError::StaleTip { .. }) => {
                info!(
                    session = %session.id,
                    branch = %session.tracked,
                    "tracked branch moved upstream; replaying session commits"
                );
            }
            Err(e) => return Err(push_failed(session, &e)),
        }
        let rebased = self.rebase_session(session).await?;
        self.push_once(session, credential)
            .await?
            .map_err(|e| push_failed(session, &e))?;
        Ok(rebased)
    }

    /// One push attempt. The outer error covers the helper script; the inner
    /// one is what git reported.
    async fn push_once(
        &self,
        session: &Session,
        credential: &Credential,
    ) -> Result<std::result::Result<(), StoreError>> {
        let helper = AskpassHelper::create(credential)?;
        let env = helper.env();
        let store = Arc::clone(&session.store);
        let workspace = session.workspace.clone();
        let remote = session.remote.clone();
        let refspec = format!("HEAD:refs/heads/{}", session.tracked);
        let pushed = self
            .inner
            .scheduler
            .run_blocking(move || Ok(store.push(&workspace, &remote, &refspec, &env)))
            .await;
        if let Err(e) = helper.remove() {
            warn!(session = %session.id, error = %e, "failed to remove askpass helper");
        }
        pushed
    }

    /// Fetch the tracked branch and replay the session branch onto it. On
    /// success the session head moves to the replayed tip.
    async fn rebase_session(&self, session: &Session) -> Result<GitOid> {
        let store = Arc::clone(&session.store);
        let workspace = session.workspace.clone();
        let remote = session.remote.clone();
        let tracked = session.tracked.clone();
        let identity = self.inner.config.identity.clone();
        let rebased = self
            .inner
            .scheduler
            .run_blocking(move || {
                store.fetch(&remote, &tracked, FetchDepth::Missing)?;
                let onto = RefName::new(&format!("refs/remotes/{remote}/{tracked}"))?;
                Ok(store.rebase_onto(&workspace, &onto, &identity)?)
            })
            .await
            .map_err(|e| SyncError::Push {
                session: session.id.clone(),
                detail: format!("could not replay onto the new {} tip: {e}", session.tracked),
            })?;
        {
            let mut core = session.core();
            core.head = rebased;
            core.touch();
        }
        debug!(session = %session.id, oid = %rebased.short(), "session branch replayed");
        Ok(rebased)
    }

    fn schedule_auto_commit(&self, session: &Session) {
        let inner = Arc::downgrade(&self.inner);
        let id = session.id.clone();
        session.auto_commit.schedule(move || async move {
            if let Some(inner) = Weak::upgrade(&inner) {
                Self { inner }.auto_commit(&id).await;
            }
        });
    }

    async fn auto_commit(&self, id: &SessionId) {
        let Ok(session) = self.session(id) else {
            debug!(session = %id, "auto-commit for a closed session");
            return;
        };
        let result = session
            .chain
            .run(|| async {
                let oid = self.commit_in_chain(&session, "").await?;
                self.push_in_chain(&session).await?;
                Ok(oid)
            })
            .await;
        match result {
            Ok(oid) => info!(session = %id, oid = %oid.short(), "auto-commit pushed"),
            Err(SyncError::EmptyCommit { .. }) => debug!(session = %id, "auto-commit had nothing to do"),
            Err(e) => warn!(session = %id, error = %e, "auto-commit failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close a session. Pending changes are committed and unpushed commits
    /// pushed first; if that fails the session is closed anyway and its
    /// workspace is left on disk.
    ///
    /// # Errors
    /// [`SyncError::SessionNotFound`].
    #[instrument(skip(self), fields(session = %id))]
    pub async fn close(&self, id: &SessionId) -> Result<WriteAck> {
        let session = self.session(id)?;
        session.auto_commit.cancel();
        let outcome = match session.chain.run(|| self.close_in_chain(&session)).await {
            Err(SyncError::ChainAborted { .. }) => {
                session.chain.run(|| self.close_in_chain(&session)).await
            }
            other => other,
        };
        if outcome.is_ok() {
            self.forget(&session);
            self.publish_workspace(&session).await;
        }
        Ok(match outcome? {
            None => WriteAck::new(Vec::new(), "session closed; workspace removed"),
            Some(failure) => WriteAck::new(
                session.pending(),
                format!(
                    "session closed, but the final commit/push failed ({failure}); workspace kept at {}",
                    session.workspace.display()
                ),
            ),
        })
    }

    /// Returns the failure that kept the workspace on disk, if any.
    async fn close_in_chain(&self, session: &Session) -> Result<Option<String>> {
        session.ensure_open()?;
        session.auto_commit.cancel();

        let dirty = !session.core().pending.is_empty();
        let mut failure = None;
        if dirty
            && let Err(e) = self.commit_in_chain(session, "").await
        {
            failure = Some(e);
        }
        if failure.is_none()
            && let Err(e) = self.push_in_chain(session).await
        {
            failure = Some(e);
        }
        session.core().state = SessionState::Closed;

        if let Some(e) = failure {
            warn!(
                session = %session.id,
                workspace = %session.workspace.display(),
                error = %e,
                "closing without a final push; workspace kept"
            );
            return Ok(Some(e.to_string()));
        }

        let store = Arc::clone(&session.store);
        let workspace = session.workspace.clone();
        let branch = session.branch.clone();
        let removed = self
            .inner
            .scheduler
            .run_blocking(move || {
                store.worktree_remove(&workspace)?;
                store.delete_branch(&branch)?;
                Ok(())
            })
            .await;
        if let Err(e) = removed {
            warn!(session = %session.id, error = %e, "failed to remove session worktree");
        }
        info!(session = %session.id, "session closed");
        Ok(None)
    }

    /// Close every session idle for longer than the configured timeout.
    /// Returns the ids that were closed.
    pub async fn reap_idle(&self) -> Vec<SessionId> {
        let timeout = self.inner.config.idle_timeout();
        let idle: Vec<SessionId> = {
            let table = self.table();
            table
                .sessions
                .values()
                .filter(|s| s.core().last_activity.elapsed() >= timeout)
                .map(|s| s.id.clone())
                .collect()
        };
        let mut closed = Vec::new();
        for id in idle {
            info!(session = %id, "closing idle session");
            match self.close(&id).await {
                Ok(_) => closed.push(id),
                Err(e) => warn!(session = %id, error = %e, "failed to close idle session"),
            }
        }
        closed
    }

    /// Run [`reap_idle`](Self::reap_idle) every reap interval until
    /// `shutdown` is cancelled or the manager is dropped.
    #[must_use]
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let every = self.inner.config.reap_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                let Some(inner) = inner.upgrade() else { break };
                Self { inner }.reap_idle().await;
            }
            debug!("session reaper stopped");
        })
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.table().sessions.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                warn!(session = %id, error = %e, "failed to close session at shutdown");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn publish_workspace(&self, session: &Session) {
        let event = SyncEvent::Workspace(WorkspaceEvent::changed(
            session.id.to_string(),
            Some(session.repo.clone()),
        ));
        if let Err(e) = self.inner.publisher.publish(event).await {
            warn!(session = %session.id, error = %e, "failed to publish workspace event");
        }
    }

    async fn publish_commit(&self, session: &Session, head: GitOid) {
        let store = Arc::clone(&session.store);
        let info = match self
            .inner
            .scheduler
            .run_blocking(move || Ok(store.read_commit(head)?))
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(session = %session.id, error = %e, "pushed commit unreadable; no event sent");
                return;
            }
        };
        let tree = info.tree;
        let record = CommitRecord::from(info);
        let event = SyncEvent::Commit(CommitEvent::from_record(
            session.repo.clone(),
            &record,
            Some(tree),
        ));
        match self.inner.publisher.publish(event).await {
            Ok(delivered) => debug!(session = %session.id, delivered, "commit event published"),
            Err(e) => warn!(session = %session.id, error = %e, "failed to publish commit event"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn generated_message(principal: &PrincipalId, files: usize) -> String {
    let noun = if files == 1 { "file" } else { "files" };
    format!("Update {files} {noun} ({principal})")
}

/// Normalize a workspace-relative path, rejecting anything that could
/// leave the workspace or touch git metadata.
fn workspace_path(raw: &str) -> Result<String> {
    let invalid = |reason: &str| SyncError::InvalidPath {
        path: raw.to_owned(),
        reason: reason.to_owned(),
    };
    if raw.contains('\\') {
        return Err(invalid("use '/' as the separator"));
    }
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| invalid("path is not UTF-8"))?;
                if part == ".git" {
                    return Err(invalid("git metadata cannot be written"));
                }
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("'..' is not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative to the repository root"));
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok(parts.join("/"))
}

/// Reject paths that pass through a symlink inside the workspace.
async fn refuse_symlinks(workspace: &Path, rel: &str) -> Result<()> {
    let mut current = workspace.to_path_buf();
    for part in rel.split('/') {
        current.push(part);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SyncError::InvalidPath {
                    path: rel.to_owned(),
                    reason: "path goes through a symbolic link".to_owned(),
                });
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

fn push_failed(session: &Session, e: &StoreError) -> SyncError {
    SyncError::Push {
        session: session.id.clone(),
        detail: e.to_string(),
    }
}
