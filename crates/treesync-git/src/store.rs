//! The [`ObjectStore`] trait: the boundary between treesync and git.
//!
//! The sync engine and the write-session manager talk to git exclusively
//! through this trait. It is object-safe, so callers hold
//! `Arc<dyn ObjectStore>` and tests can substitute their own store.
//!
//! Every method is synchronous and may spawn a `git` process or touch the
//! object database; async callers run them on blocking threads.
//!
//! | Group      | Methods                                                   |
//! |------------|-----------------------------------------------------------|
//! | Transport  | `fetch`, `remote_head`, `push`, `set_remote`              |
//! | Refs       | `read_ref`, `force_update_ref`, `is_ancestor`             |
//! | Objects    | `has_object`, `read_blob_at`, `read_commit`, `log`, ...   |
//! | Working    | `checkout_branch`, `write_snapshot`, `commit_paths`, ...  |
//! | Worktrees  | `worktree_add`, `worktree_remove`, `worktree_list`, ...   |
//!
//! Construction (clone, init, open) lives on the concrete
//! [`GitStore`](crate::GitStore) because it precedes the existence of a
//! repository handle.

use std::path::Path;

use crate::error::StoreError;
use crate::types::{
    CommitInfo, FetchDepth, GitOid, Identity, RefName, SnapshotFile, WorktreeInfo,
};

/// Content-addressed object store contract.
///
/// Objects are immutable and addressed by the hash of their content; a fetch
/// never overwrites an object that already exists locally. Implementations
/// must never invent ids: every [`GitOid`] they return was assigned by git.
pub trait ObjectStore: Send + Sync {
    /// Root of the repository's working tree.
    fn root(&self) -> &Path;

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// Fetch `branch` from `remote` into `refs/remotes/<remote>/<branch>`.
    ///
    /// With [`FetchDepth::Missing`] only the ancestry missing locally is
    /// transferred; with [`FetchDepth::Deepen`] a shallow history is extended.
    fn fetch(&self, remote: &str, branch: &str, depth: FetchDepth) -> Result<(), StoreError>;

    /// Resolve the tip of `branch` on `remote` without fetching objects.
    fn remote_head(&self, remote: &str, branch: &str) -> Result<Option<GitOid>, StoreError>;

    /// Push `refspec` from the worktree at `workdir` to `remote`.
    ///
    /// `env` is applied to the git process only. Credentials must travel
    /// through it (e.g. `GIT_ASKPASS`), never through the refspec or remote.
    fn push(
        &self,
        workdir: &Path,
        remote: &str,
        refspec: &str,
        env: &[(String, String)],
    ) -> Result<(), StoreError>;

    /// Add or re-point a named remote.
    fn set_remote(&self, name: &str, url: &str) -> Result<(), StoreError>;

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Resolve a ref, returning `None` if it does not exist.
    fn read_ref(&self, name: &RefName) -> Result<Option<GitOid>, StoreError>;

    /// Point `name` at `oid` regardless of its previous value.
    fn force_update_ref(&self, name: &RefName, oid: GitOid, reason: &str)
        -> Result<(), StoreError>;

    /// `true` if `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, ancestor: GitOid, descendant: GitOid) -> Result<bool, StoreError>;

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// `true` if the object is present in the local store.
    fn has_object(&self, oid: GitOid) -> Result<bool, StoreError>;

    /// Read the blob stored at `path` in the tree of `commit`.
    ///
    /// Returns [`StoreError::MissingObject`] when the commit or one of the
    /// trees/blobs on the way is not present locally, and
    /// [`StoreError::NotFound`] when the path does not exist in that tree.
    fn read_blob_at(&self, commit: GitOid, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Read a commit's metadata and changed-path set.
    ///
    /// A commit on the shallow boundary yields
    /// [`StoreError::ShallowBoundary`]: its parents are not local, so its
    /// parent list and changes cannot be stated.
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, StoreError>;

    /// Up to `limit` commits reachable from `rev`, newest first. Shallow
    /// boundary commits are left out, so fewer than `limit` may come back
    /// even when the remote has more.
    fn log(&self, rev: &str, limit: usize) -> Result<Vec<CommitInfo>, StoreError>;

    /// `true` if the local history stops at a shallow boundary.
    fn is_shallow(&self) -> Result<bool, StoreError>;

    // -----------------------------------------------------------------------
    // Working tree
    // -----------------------------------------------------------------------

    /// Make `branch` the checked-out branch and force the index and working
    /// tree to match its tip.
    fn checkout_branch(&self, branch: &str) -> Result<(), StoreError>;

    /// Write `files` into the working tree and record them as one commit on
    /// the current branch. Returns the store-assigned commit id.
    fn write_snapshot(
        &self,
        files: &[SnapshotFile],
        message: &str,
        identity: &Identity,
    ) -> Result<GitOid, StoreError>;

    /// Record exactly `paths` of the worktree at `workdir` as one commit on
    /// that worktree's branch. Paths missing on disk are recorded as
    /// deletions. Returns the store-assigned commit id.
    fn commit_paths(
        &self,
        workdir: &Path,
        paths: &[String],
        message: &str,
        identity: &Identity,
    ) -> Result<GitOid, StoreError>;

    /// Replay the commits of the worktree at `workdir` that `onto` lacks on
    /// top of `onto`, and return the new head. Uncommitted tracked changes
    /// are carried across. On conflict the replay is abandoned, the worktree
    /// is restored and [`StoreError::RebaseConflict`] is returned.
    fn rebase_onto(
        &self,
        workdir: &Path,
        onto: &RefName,
        identity: &Identity,
    ) -> Result<GitOid, StoreError>;

    // -----------------------------------------------------------------------
    // Worktrees
    // -----------------------------------------------------------------------

    /// Create a linked worktree at `path` on a new branch based at `base`.
    fn worktree_add(&self, path: &Path, new_branch: &str, base: GitOid) -> Result<(), StoreError>;

    /// Remove the linked worktree at `path`, discarding its working files.
    fn worktree_remove(&self, path: &Path) -> Result<(), StoreError>;

    /// List linked worktrees (the main working tree excluded).
    fn worktree_list(&self) -> Result<Vec<WorktreeInfo>, StoreError>;

    /// Delete a local branch. No-op if it does not exist.
    fn delete_branch(&self, branch: &str) -> Result<(), StoreError>;
}
