//! gix-backed object presence checks and path lookups.

use crate::error::StoreError;
use crate::git_store::GitStore;
use crate::refs_impl::{from_gix_oid, to_gix_oid};
use crate::types::GitOid;

pub fn has_object(repo: &GitStore, oid: GitOid) -> Result<bool, StoreError> {
    let gix_repo = repo.gix()?;
    Ok(gix_repo.find_object(to_gix_oid(oid)).is_ok())
}

/// Walk `path` from the root tree of `commit` down to a blob.
///
/// Absence of an *object* is reported as [`StoreError::MissingObject`];
/// absence of a *path component* in a present tree is [`StoreError::NotFound`].
pub fn read_blob_at(repo: &GitStore, commit: GitOid, path: &str) -> Result<Vec<u8>, StoreError> {
    let gix_repo = repo.gix()?;
    let commit_obj = gix_repo
        .find_commit(to_gix_oid(commit))
        .map_err(|_| StoreError::MissingObject { oid: commit })?;
    let decoded = commit_obj.decode().map_err(|e| StoreError::Backend {
        message: format!("failed to decode commit {commit}: {e}"),
    })?;
    let mut current = from_gix_oid(&decoded.tree());

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Err(StoreError::NotFound {
            message: format!("empty path in {}", commit.short()),
        });
    }

    for (depth, name) in components.iter().enumerate() {
        let tree = gix_repo
            .find_tree(to_gix_oid(current))
            .map_err(|_| StoreError::MissingObject { oid: current })?;
        let mut next = None;
        for entry in tree.iter() {
            let entry = entry.map_err(|e| StoreError::Backend {
                message: format!("failed to decode tree entry: {e}"),
            })?;
            if entry.inner.filename == name.as_bytes() {
                next = Some((from_gix_oid(entry.inner.oid), entry.inner.mode.is_tree()));
                break;
            }
        }
        let is_last = depth + 1 == components.len();
        match next {
            Some((oid, is_tree)) if is_tree != is_last => current = oid,
            _ => {
                return Err(StoreError::NotFound {
                    message: format!("{path} does not exist in {}", commit.short()),
                });
            }
        }
    }

    let mut blob = gix_repo
        .find_blob(to_gix_oid(current))
        .map_err(|_| StoreError::MissingObject { oid: current })?;
    Ok(blob.take_data())
}
