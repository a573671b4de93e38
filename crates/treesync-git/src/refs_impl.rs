//! Ref reads (gix) and ref updates / ancestry checks (git CLI).

use crate::error::StoreError;
use crate::git_store::GitStore;
use crate::types::{GitOid, RefName};

/// Convert a `gix::oid` to a `GitOid`.
pub(crate) fn from_gix_oid(oid: &gix::oid) -> GitOid {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(oid.as_bytes());
    GitOid::from_bytes(bytes)
}

/// Convert a `GitOid` to a `gix::ObjectId`.
pub(crate) fn to_gix_oid(oid: GitOid) -> gix::ObjectId {
    gix::ObjectId::from_bytes_or_panic(oid.as_bytes())
}

pub fn read_ref(repo: &GitStore, name: &RefName) -> Result<Option<GitOid>, StoreError> {
    let gix_repo = repo.gix()?;
    match gix_repo.try_find_reference(name.as_str()) {
        Ok(Some(mut r)) => {
            let id = r.peel_to_id_in_place().map_err(|e| StoreError::Backend {
                message: format!("peel {name}: {e}"),
            })?;
            Ok(Some(from_gix_oid(&id)))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(StoreError::Backend {
            message: format!("read {name}: {e}"),
        }),
    }
}

pub fn force_update_ref(
    repo: &GitStore,
    name: &RefName,
    oid: GitOid,
    reason: &str,
) -> Result<(), StoreError> {
    let oid = oid.to_string();
    repo.git(["update-ref", "-m", reason, name.as_str(), oid.as_str()])?;
    Ok(())
}

pub fn is_ancestor(
    repo: &GitStore,
    ancestor: GitOid,
    descendant: GitOid,
) -> Result<bool, StoreError> {
    if ancestor == descendant {
        return Ok(true);
    }
    let (a, d) = (ancestor.to_string(), descendant.to_string());
    match repo.git(["merge-base", "--is-ancestor", a.as_str(), d.as_str()]) {
        Ok(_) => Ok(true),
        Err(StoreError::Command {
            exit_code: Some(1), ..
        }) => Ok(false),
        Err(e) => Err(e),
    }
}
