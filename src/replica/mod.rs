//! Replica sync engine.
//!
//! A [`Replica`] is a shallow, single-branch copy of one upstream repository
//! that converges on upstream by fetching. Object ids on a replica are always
//! the ones upstream computed: commits arrive by fetch, never by replaying
//! event payloads.
//!
//! ```text
//! Uninitialized ──bootstrap──▶ Bootstrapping ──▶ Ready ⇄ Syncing
//!                                    ▲              │
//!                                    └──full resync─┘
//! ```
//!
//! Each replica runs one store operation at a time. Identical concurrent
//! requests (two bootstraps, two applies of the same commit, two deepens)
//! collapse into one in-flight operation.

pub mod driver;
pub mod metadata;
pub mod registry;
pub mod singleflight;
pub mod upstream;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use treesync_git::{
    FetchDepth, GitOid, GitStore, Identity, ObjectStore, RefName, StoreError,
};

use crate::config::{RepoEntry, TreesyncConfig};
use crate::error::{Result, SyncError};
use crate::event::CommitEvent;
use crate::model::{CommitRecord, RepoSlug};

pub use driver::ReplicaEventHandler;
pub use metadata::ReplicaMetadata;
pub use registry::ReplicaRegistry;
pub use singleflight::SingleFlight;
pub use upstream::{BootstrapSource, HistorySource, HttpUpstream, RepoSnapshot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Uninitialized,
    Bootstrapping,
    Ready,
    Syncing,
}

/// What applying a commit did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The commit is the cursor or one of its ancestors.
    NoOp,
    /// The commit was already in the store; the branch was moved to it.
    AlreadyPresent,
    /// The commit was fetched and checked out.
    Applied,
    /// Applying failed and the replica was rebuilt by a fresh bootstrap.
    Resynced,
}

/// Point-in-time view of a replica, for callers and the CLI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub slug: RepoSlug,
    pub state: ReplicaState,
    pub cursor: Option<GitOid>,
    pub synthetic: bool,
}

/// Everything a replica needs to know about where it syncs from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSettings {
    pub slug: RepoSlug,
    pub url: String,
    pub branch: String,
    pub remote: String,
    pub clone_depth: u32,
    pub deepen_by: u32,
    pub history_limit: usize,
    /// Working tree of the replica. Metadata sits next to it.
    pub dir: PathBuf,
}

impl ReplicaSettings {
    #[must_use]
    pub fn from_config(config: &TreesyncConfig, entry: &RepoEntry) -> Self {
        let replica = &config.replica;
        Self {
            slug: entry.slug.clone(),
            url: entry.url.clone(),
            branch: entry
                .branch
                .clone()
                .unwrap_or_else(|| replica.branch.clone()),
            remote: replica.remote.clone(),
            clone_depth: replica.clone_depth,
            deepen_by: replica.deepen_by,
            history_limit: replica.history_limit,
            dir: replica.data_dir.join(entry.slug.rel_path()),
        }
    }

    fn metadata_path(&self) -> PathBuf {
        ReplicaMetadata::path_for(&self.dir)
    }
}

struct Status {
    state: ReplicaState,
    cursor: Option<GitOid>,
    synthetic: bool,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Status {
    const fn empty() -> Self {
        Self {
            state: ReplicaState::Uninitialized,
            cursor: None,
            synthetic: false,
            store: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

pub struct Replica {
    settings: ReplicaSettings,
    status: Mutex<Status>,
    op_lock: tokio::sync::Mutex<()>,
    bootstraps: SingleFlight<(), GitOid>,
    applies: SingleFlight<GitOid, ApplyOutcome>,
    deepens: SingleFlight<(), ()>,
}

impl Replica {
    /// Open the replica described by `settings`, picking up a copy left on
    /// disk by an earlier run. Without one the replica is `Uninitialized`.
    pub async fn open(settings: ReplicaSettings) -> Arc<Self> {
        let on_disk = settings.clone();
        let status = tokio::task::spawn_blocking(move || load_status(&on_disk))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "replica load task failed");
                Status::empty()
            });
        Arc::new(Self {
            settings,
            status: Mutex::new(status),
            op_lock: tokio::sync::Mutex::new(()),
            bootstraps: SingleFlight::default(),
            applies: SingleFlight::default(),
            deepens: SingleFlight::default(),
        })
    }

    #[must_use]
    pub const fn slug(&self) -> &RepoSlug {
        &self.settings.slug
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    #[must_use]
    pub const fn settings(&self) -> &ReplicaSettings {
        &self.settings
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        let status = self.lock_status();
        ReplicaStatus {
            slug: self.settings.slug.clone(),
            state: status.state,
            cursor: status.cursor,
            synthetic: status.synthetic,
        }
    }

    #[must_use]
    pub fn state(&self) -> ReplicaState {
        self.lock_status().state
    }

    /// Last applied commit.
    #[must_use]
    pub fn cursor(&self) -> Option<GitOid> {
        self.lock_status().cursor
    }

    /// `true` once the replica holds a usable copy, including while it syncs.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ReplicaState::Ready | ReplicaState::Syncing)
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.state() == ReplicaState::Syncing
    }

    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.lock_status().synthetic
    }

    fn set_state(&self, state: ReplicaState) {
        self.lock_status().state = state;
    }

    fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.lock_status()
            .store
            .clone()
            .ok_or_else(|| SyncError::NotFound {
                what: format!("replica of '{}' (not bootstrapped)", self.settings.slug),
            })
    }

    /// Install a freshly built store as the current copy and persist it.
    fn install(&self, store: Arc<dyn ObjectStore>, head: GitOid, synthetic: bool) {
        {
            let mut status = self.lock_status();
            *status = Status {
                state: ReplicaState::Ready,
                cursor: Some(head),
                synthetic,
                store: Some(store),
            };
        }
        self.persist(Some(head), synthetic);
    }

    fn advance(&self, head: GitOid) {
        let synthetic = {
            let mut status = self.lock_status();
            status.cursor = Some(head);
            status.synthetic
        };
        self.persist(Some(head), synthetic);
    }

    fn persist(&self, head: Option<GitOid>, synthetic: bool) {
        let meta = ReplicaMetadata::now(head, synthetic);
        if let Err(e) = meta.save(&self.settings.metadata_path()) {
            warn!(repo = %self.settings.slug, error = %e, "failed to persist replica metadata");
        }
    }

    /// Return the cursor, bootstrapping first if the replica has no copy yet.
    /// With a `fallback`, a failed clone falls back to a bulk snapshot.
    ///
    /// # Errors
    /// Returns the bootstrap error.
    pub async fn ensure_ready(
        self: &Arc<Self>,
        fallback: Option<&dyn BootstrapSource>,
    ) -> Result<GitOid> {
        if let Some(cursor) = self.cursor()
            && self.is_ready()
        {
            return Ok(cursor);
        }
        match fallback {
            Some(source) => self.bootstrap_with_fallback(source).await,
            None => self.bootstrap().await,
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Replace the local copy with a fresh shallow clone of the tracked
    /// branch and make its tip the cursor.
    ///
    /// The clone is built next to the replica and swapped in only once it
    /// succeeded, so a failed bootstrap leaves the previous copy usable.
    ///
    /// # Errors
    /// [`SyncError::Bootstrap`] if cloning fails.
    #[instrument(skip(self), fields(repo = %self.settings.slug))]
    pub async fn bootstrap(self: &Arc<Self>) -> Result<GitOid> {
        let this = Arc::clone(self);
        self.bootstraps
            .run((), move || async move { this.bootstrap_exclusive().await })
            .await
    }

    async fn bootstrap_exclusive(&self) -> Result<GitOid> {
        let _op = self.op_lock.lock().await;
        let previous = self.state();
        self.set_state(ReplicaState::Bootstrapping);

        let settings = self.settings.clone();
        match blocking(move || clone_fresh(&settings)).await {
            Ok((store, head)) => {
                self.install(store, head, false);
                info!(head = %head.short(), "replica bootstrapped");
                Ok(head)
            }
            Err(e) => {
                let restored = if previous == ReplicaState::Uninitialized {
                    ReplicaState::Uninitialized
                } else {
                    ReplicaState::Ready
                };
                self.set_state(restored);
                warn!(error = %e, "bootstrap failed");
                Err(SyncError::Bootstrap {
                    repo: self.settings.slug.clone(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// [`bootstrap`](Self::bootstrap), falling back to a bulk snapshot from
    /// `source` when cloning fails.
    ///
    /// A replica built from a snapshot holds one synthetic root commit whose
    /// id does not match upstream. It serves reads, but applying commits to
    /// it fails until the next successful bootstrap.
    ///
    /// # Errors
    /// [`SyncError::Bootstrap`] if both the clone and the fallback fail.
    #[instrument(skip(self, source), fields(repo = %self.settings.slug))]
    pub async fn bootstrap_with_fallback(
        self: &Arc<Self>,
        source: &dyn BootstrapSource,
    ) -> Result<GitOid> {
        let clone_error = match self.bootstrap().await {
            Ok(head) => return Ok(head),
            Err(SyncError::Bootstrap { detail, .. }) => detail,
            Err(other) => return Err(other),
        };
        warn!(detail = %clone_error, "clone failed; falling back to upstream snapshot");

        let fallback_error = |e: SyncError| SyncError::Bootstrap {
            repo: self.settings.slug.clone(),
            detail: format!("{clone_error}; snapshot fallback failed: {e}"),
        };
        let snapshot = source
            .snapshot(&self.settings.slug)
            .await
            .map_err(fallback_error)?;
        self.install_snapshot(snapshot).await.map_err(fallback_error)
    }

    async fn install_snapshot(&self, snapshot: RepoSnapshot) -> Result<GitOid> {
        let _op = self.op_lock.lock().await;
        let previous = self.state();
        self.set_state(ReplicaState::Bootstrapping);

        let settings = self.settings.clone();
        let result = blocking(move || {
            let staging = staging_dir(&settings.dir);
            remove_dir_if_exists(&staging)?;
            let store = GitStore::init(&staging, &settings.branch)?;
            let message = match &snapshot.head_commit {
                Some(head) => format!("Snapshot of {} at {head}", settings.slug),
                None => format!("Snapshot of {}", settings.slug),
            };
            store.write_snapshot(&snapshot.to_store_files(), &message, &snapshot_identity())?;
            swap_in(&staging, &settings.dir)?;
            let store = GitStore::open(&settings.dir)?;
            let head = store
                .read_ref(&RefName::branch(&settings.branch)?)?
                .ok_or_else(|| SyncError::NotFound {
                    what: format!("branch '{}' after snapshot", settings.branch),
                })?;
            Ok((Arc::new(store) as Arc<dyn ObjectStore>, head))
        })
        .await;

        match result {
            Ok((store, head)) => {
                self.install(store, head, true);
                info!(head = %head.short(), "replica initialized from snapshot");
                Ok(head)
            }
            Err(e) => {
                self.set_state(if previous == ReplicaState::Uninitialized {
                    ReplicaState::Uninitialized
                } else {
                    ReplicaState::Ready
                });
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Bring the replica to the commit announced by `event`.
    ///
    /// Idempotent: re-applying the cursor or any of its ancestors is a
    /// [`NoOp`](ApplyOutcome::NoOp) and the cursor never moves backwards.
    ///
    /// # Errors
    /// [`SyncError::ApplyCommit`] if fetching, verifying or checking out
    /// fails, or if the replica is synthetic. Nothing is retried.
    #[instrument(skip(self, event), fields(repo = %self.settings.slug, oid = %event.oid.short()))]
    pub async fn apply_commit(self: &Arc<Self>, event: &CommitEvent) -> Result<ApplyOutcome> {
        if event.repo_slug != self.settings.slug {
            return Err(SyncError::Invalid {
                value: event.repo_slug.to_string(),
                reason: format!("event is for a different repository than '{}'", self.settings.slug),
            });
        }
        self.apply_oid(event.oid).await
    }

    async fn apply_oid(self: &Arc<Self>, oid: GitOid) -> Result<ApplyOutcome> {
        let this = Arc::clone(self);
        self.applies
            .run(oid, move || async move { this.apply_exclusive(oid).await })
            .await
    }

    async fn apply_exclusive(&self, oid: GitOid) -> Result<ApplyOutcome> {
        let _op = self.op_lock.lock().await;
        let apply_error = |detail: String| SyncError::ApplyCommit {
            repo: self.settings.slug.clone(),
            oid,
            detail,
        };

        let (store, cursor) = {
            let status = self.lock_status();
            if status.synthetic {
                return Err(apply_error(
                    "replica was initialized from a snapshot and does not share upstream history"
                        .to_owned(),
                ));
            }
            match &status.store {
                Some(store) => (Arc::clone(store), status.cursor),
                None => return Err(apply_error("replica is not bootstrapped".to_owned())),
            }
        };

        self.set_state(ReplicaState::Syncing);
        let settings = self.settings.clone();
        let result = blocking(move || apply_to_store(store.as_ref(), &settings, oid, cursor)).await;
        self.set_state(ReplicaState::Ready);

        match result {
            Ok(outcome) => {
                if matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::AlreadyPresent) {
                    self.advance(oid);
                }
                debug!(?outcome, "commit applied");
                Ok(outcome)
            }
            Err(e) => Err(apply_error(e.to_string())),
        }
    }

    /// [`apply_commit`](Self::apply_commit), running a full bootstrap when
    /// applying fails.
    ///
    /// # Errors
    /// The bootstrap error if the resync fails too.
    pub async fn apply_or_resync(self: &Arc<Self>, event: &CommitEvent) -> Result<ApplyOutcome> {
        match self.apply_commit(event).await {
            Err(SyncError::ApplyCommit { detail, .. }) => self.resync(&detail).await,
            other => other,
        }
    }

    async fn apply_oid_or_resync(self: &Arc<Self>, oid: GitOid) -> Result<ApplyOutcome> {
        match self.apply_oid(oid).await {
            Err(SyncError::ApplyCommit { detail, .. }) => self.resync(&detail).await,
            other => other,
        }
    }

    async fn resync(self: &Arc<Self>, cause: &str) -> Result<ApplyOutcome> {
        warn!(repo = %self.settings.slug, %cause, "apply failed; running full resync");
        self.bootstrap().await?;
        Ok(ApplyOutcome::Resynced)
    }

    /// Compare the upstream tip with the cursor and catch up if they differ.
    ///
    /// Returns `None` when there was nothing to compare: the replica has no
    /// copy yet, or upstream has no such branch.
    ///
    /// # Errors
    /// Store errors from `ls-remote`, or the resync error.
    #[instrument(skip(self), fields(repo = %self.settings.slug))]
    pub async fn revalidate(self: &Arc<Self>) -> Result<Option<ApplyOutcome>> {
        let Ok(store) = self.store() else {
            debug!("not bootstrapped; nothing to revalidate");
            return Ok(None);
        };
        if self.is_synthetic() {
            return self.resync("replica is synthetic").await.map(Some);
        }

        let remote_head = {
            let _op = self.op_lock.lock().await;
            let (remote, branch) = (self.settings.remote.clone(), self.settings.branch.clone());
            blocking(move || Ok(store.remote_head(&remote, &branch)?)).await?
        };
        match remote_head {
            None => {
                warn!("upstream has no tracked branch");
                Ok(None)
            }
            Some(head) if Some(head) == self.cursor() => Ok(Some(ApplyOutcome::NoOp)),
            Some(head) => {
                info!(head = %head.short(), "upstream moved; catching up");
                self.apply_oid_or_resync(head).await.map(Some)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Content of `path` at commit `at` (default: the cursor).
    ///
    /// An object missing from the shallow history triggers one deepen and
    /// one retry.
    ///
    /// # Errors
    /// [`SyncError::NotFound`] if the path is absent, or the object is still
    /// missing after deepening.
    pub async fn read_object_at(
        self: &Arc<Self>,
        path: &str,
        at: Option<GitOid>,
    ) -> Result<Vec<u8>> {
        let commit = self.resolve(at)?;
        let path_owned = path.to_owned();
        self.read_with_deepen(
            || format!("'{path}' at {}", commit.short()),
            move |store| store.read_blob_at(commit, &path_owned),
        )
        .await
    }

    /// Metadata and changed paths of commit `id`, deepening once if needed.
    ///
    /// # Errors
    /// [`SyncError::NotFound`] if the commit cannot be found.
    pub async fn read_commit_meta(self: &Arc<Self>, id: GitOid) -> Result<CommitRecord> {
        self.read_with_deepen(
            || format!("commit {}", id.short()),
            move |store| store.read_commit(id).map(CommitRecord::from),
        )
        .await
    }

    /// Up to `depth` commits of the tracked branch, newest first. When the
    /// shallow edge cuts the walk short, history is deepened once and walked
    /// again; the boundary commit itself is never listed, since its parents
    /// and changes are unknown locally.
    ///
    /// # Errors
    /// Store errors, or [`SyncError::NotFound`] if not bootstrapped.
    pub async fn history(self: &Arc<Self>, depth: usize) -> Result<Vec<CommitRecord>> {
        let (commits, cut_short) = self.local_history(depth).await?;
        if !cut_short {
            return Ok(commits);
        }
        debug!(
            repo = %self.settings.slug,
            found = commits.len(),
            depth,
            "history stops at the shallow edge; deepening"
        );
        if let Err(e) = self.deepen().await {
            warn!(repo = %self.settings.slug, error = %e, "deepen failed; history truncated");
            return Ok(commits);
        }
        Ok(self.local_history(depth).await?.0)
    }

    async fn local_history(&self, depth: usize) -> Result<(Vec<CommitRecord>, bool)> {
        let store = self.store()?;
        let _op = self.op_lock.lock().await;
        let rev = format!("refs/heads/{}", self.settings.branch);
        blocking(move || {
            let commits = store.log(&rev, depth)?;
            let cut_short = commits.len() < depth && store.is_shallow()?;
            Ok((commits.into_iter().map(CommitRecord::from).collect(), cut_short))
        })
        .await
    }

    /// Local history merged with the history upstream serves, deduplicated
    /// by id, newest first. An unreachable upstream yields local history.
    ///
    /// # Errors
    /// Errors reading local history.
    pub async fn full_history(
        self: &Arc<Self>,
        source: &dyn HistorySource,
    ) -> Result<Vec<CommitRecord>> {
        let local = self.history(self.settings.history_limit).await?;
        let remote = match source.history(&self.settings.slug).await {
            Ok(commits) => commits,
            Err(e) => {
                warn!(repo = %self.settings.slug, error = %e, "upstream history unavailable");
                Vec::new()
            }
        };
        Ok(merge_history(local, remote))
    }

    fn resolve(&self, at: Option<GitOid>) -> Result<GitOid> {
        at.or_else(|| self.cursor())
            .ok_or_else(|| SyncError::NotFound {
                what: format!("replica of '{}' (not bootstrapped)", self.settings.slug),
            })
    }

    async fn read_with_deepen<T, F>(
        self: &Arc<Self>,
        what: impl Fn() -> String,
        read: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn ObjectStore) -> std::result::Result<T, StoreError> + Send + Sync + 'static,
    {
        let read = Arc::new(read);
        let not_found = |e: SyncError| match e {
            SyncError::Store(
                StoreError::NotFound { .. }
                | StoreError::MissingObject { .. }
                | StoreError::ShallowBoundary { .. },
            ) => SyncError::NotFound { what: what() },
            other => other,
        };

        match self.read_locked(Arc::clone(&read)).await {
            Err(e) if e.is_missing_object() => {
                debug!(repo = %self.settings.slug, "object beyond shallow history; deepening");
                if let Err(e) = self.deepen().await {
                    warn!(repo = %self.settings.slug, error = %e, "deepen failed");
                }
                self.read_locked(read).await.map_err(not_found)
            }
            other => other.map_err(not_found),
        }
    }

    async fn read_locked<T, F>(&self, read: Arc<F>) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn ObjectStore) -> std::result::Result<T, StoreError> + Send + Sync + 'static,
    {
        let store = self.store()?;
        let _op = self.op_lock.lock().await;
        blocking(move || Ok(read(store.as_ref())?)).await
    }

    /// Extend the shallow history by `deepen_by` commits.
    ///
    /// # Errors
    /// Store errors from the fetch.
    pub async fn deepen(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.deepens
            .run((), move || async move {
                let store = this.store()?;
                let _op = this.op_lock.lock().await;
                let s = this.settings.clone();
                blocking(move || {
                    Ok(store.fetch(&s.remote, &s.branch, FetchDepth::Deepen(s.deepen_by))?)
                })
                .await
            })
            .await
    }

    /// Delete the local copy and its metadata.
    ///
    /// # Errors
    /// I/O errors removing the files.
    pub async fn wipe(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        *self.lock_status() = Status::empty();
        let settings = self.settings.clone();
        blocking(move || {
            remove_dir_if_exists(&settings.dir)?;
            remove_dir_if_exists(&staging_dir(&settings.dir))?;
            ReplicaMetadata::remove(&settings.metadata_path())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn load_status(settings: &ReplicaSettings) -> Status {
    let Ok(store) = GitStore::open(&settings.dir) else {
        return Status::empty();
    };
    let meta = ReplicaMetadata::load(&settings.metadata_path());
    let cursor = match meta.as_ref().and_then(|m| m.remote_head) {
        Some(head) => Some(head),
        None => RefName::branch(&settings.branch)
            .ok()
            .and_then(|r| store.read_ref(&r).ok().flatten()),
    };
    let Some(cursor) = cursor else {
        return Status::empty();
    };
    debug!(repo = %settings.slug, cursor = %cursor.short(), "found replica on disk");
    Status {
        state: ReplicaState::Ready,
        cursor: Some(cursor),
        synthetic: meta.is_some_and(|m| m.synthetic),
        store: Some(Arc::new(store) as Arc<dyn ObjectStore>),
    }
}

fn clone_fresh(settings: &ReplicaSettings) -> Result<(Arc<dyn ObjectStore>, GitOid)> {
    let staging = staging_dir(&settings.dir);
    remove_dir_if_exists(&staging)?;
    GitStore::clone_shallow(&settings.url, &settings.branch, settings.clone_depth, &staging)?;
    swap_in(&staging, &settings.dir)?;
    let store = GitStore::open(&settings.dir)?;
    let head = store
        .read_ref(&RefName::branch(&settings.branch)?)?
        .ok_or_else(|| SyncError::NotFound {
            what: format!("branch '{}' in the clone", settings.branch),
        })?;
    Ok((Arc::new(store) as Arc<dyn ObjectStore>, head))
}

fn apply_to_store(
    store: &dyn ObjectStore,
    settings: &ReplicaSettings,
    oid: GitOid,
    cursor: Option<GitOid>,
) -> Result<ApplyOutcome> {
    if cursor == Some(oid) {
        return Ok(ApplyOutcome::NoOp);
    }
    let present = store.has_object(oid)?;
    if !present {
        store.fetch(&settings.remote, &settings.branch, FetchDepth::Missing)?;
        if !store.has_object(oid)? {
            return Err(SyncError::NotFound {
                what: format!("commit {} on the remote after fetching", oid.short()),
            });
        }
    }
    if let Some(cursor) = cursor
        && store.is_ancestor(oid, cursor)?
    {
        debug!(oid = %oid.short(), "stale event: commit is behind the cursor");
        return Ok(ApplyOutcome::NoOp);
    }
    let branch = RefName::branch(&settings.branch)?;
    store.force_update_ref(&branch, oid, &format!("treesync: apply {}", oid.short()))?;
    store.checkout_branch(&settings.branch)?;
    Ok(if present {
        ApplyOutcome::AlreadyPresent
    } else {
        ApplyOutcome::Applied
    })
}

fn staging_dir(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(".incoming");
    PathBuf::from(name)
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn swap_in(staging: &Path, dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir)?;
    std::fs::rename(staging, dir)?;
    Ok(())
}

fn snapshot_identity() -> Identity {
    Identity {
        name: "treesync".to_owned(),
        email: "treesync@localhost".to_owned(),
    }
}

/// Merge local and upstream history: one entry per id (local wins), newest
/// first, equal timestamps ordered by id. Local history never holds shallow
/// boundary commits, so those always come from upstream.
#[must_use]
pub fn merge_history(local: Vec<CommitRecord>, remote: Vec<CommitRecord>) -> Vec<CommitRecord> {
    let mut seen = HashSet::new();
    let mut merged: Vec<CommitRecord> = local
        .into_iter()
        .chain(remote)
        .filter(|c| seen.insert(c.oid))
        .collect();
    merged.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.oid.cmp(&b.oid))
    });
    merged
}
