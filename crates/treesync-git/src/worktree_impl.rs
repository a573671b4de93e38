//! Working-tree writes, commits and linked-worktree lifecycle.
//!
//! These go through the `git` CLI, which owns index locking and the
//! worktree admin directory layout.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::git_store::GitStore;
use crate::store::ObjectStore as _;
use crate::types::{GitOid, Identity, RefName, SnapshotFile, WorktreeInfo};

pub fn checkout_branch(repo: &GitStore, branch: &str) -> Result<(), StoreError> {
    let full = format!("refs/heads/{branch}");
    repo.git(["symbolic-ref", "HEAD", full.as_str()])?;
    repo.git(["reset", "--hard", "--quiet", full.as_str()])?;
    Ok(())
}

/// Reject absolute paths and any `..` component.
fn safe_relative(path: &str) -> Result<PathBuf, StoreError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p.to_path_buf())
    } else {
        Err(StoreError::NotFound {
            message: format!("`{path}` is not a path inside the working tree"),
        })
    }
}

fn identity_env(identity: &Identity) -> Vec<(String, String)> {
    vec![
        ("GIT_AUTHOR_NAME".into(), identity.name.clone()),
        ("GIT_AUTHOR_EMAIL".into(), identity.email.clone()),
        ("GIT_COMMITTER_NAME".into(), identity.name.clone()),
        ("GIT_COMMITTER_EMAIL".into(), identity.email.clone()),
    ]
}

fn commit_and_resolve(
    workdir: &Path,
    message: &str,
    identity: &Identity,
) -> Result<GitOid, StoreError> {
    GitStore::git_in(
        workdir,
        [
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--allow-empty",
            "--no-verify",
            "--quiet",
            "-m",
            message,
        ],
        &identity_env(identity),
    )?;
    let head = GitStore::git_in(workdir, ["rev-parse", "HEAD"], &[])?;
    Ok(head.parse()?)
}

#[instrument(skip(repo, files, identity), fields(root = %repo.root().display(), files = files.len()))]
pub fn write_snapshot(
    repo: &GitStore,
    files: &[SnapshotFile],
    message: &str,
    identity: &Identity,
) -> Result<GitOid, StoreError> {
    for file in files {
        let rel = safe_relative(&file.path)?;
        let abs = repo.root().join(rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, &file.content)?;
    }
    repo.git(["add", "-A"])?;
    let oid = commit_and_resolve(repo.root(), message, identity)?;
    debug!(%oid, "snapshot committed");
    Ok(oid)
}

/// Stage exactly `paths` (additions, modifications and deletions) and
/// commit them. Anything else modified in the worktree stays unstaged.
#[instrument(skip(paths, identity), fields(workdir = %workdir.display(), paths = paths.len()))]
pub fn commit_paths(
    workdir: &Path,
    paths: &[String],
    message: &str,
    identity: &Identity,
) -> Result<GitOid, StoreError> {
    let mut present = Vec::new();
    let mut removed = Vec::new();
    for path in paths {
        let rel = safe_relative(path)?;
        if workdir.join(&rel).exists() {
            present.push(path.as_str());
        } else {
            removed.push(path.as_str());
        }
    }
    if !present.is_empty() {
        let mut args = vec!["update-index", "--add", "--"];
        args.extend(present);
        GitStore::git_in(workdir, args, &[])?;
    }
    if !removed.is_empty() {
        let mut args = vec!["update-index", "--force-remove", "--"];
        args.extend(removed);
        GitStore::git_in(workdir, args, &[])?;
    }
    commit_and_resolve(workdir, message, identity)
}

#[instrument(skip(identity), fields(workdir = %workdir.display()))]
pub fn rebase_onto(
    workdir: &Path,
    onto: &RefName,
    identity: &Identity,
) -> Result<GitOid, StoreError> {
    let mut env = identity_env(identity);
    env.push(("GIT_EDITOR".into(), "true".into()));
    let replayed = GitStore::git_in(
        workdir,
        [
            "-c",
            "commit.gpgsign=false",
            "rebase",
            "--quiet",
            "--autostash",
            onto.as_str(),
        ],
        &env,
    );
    match replayed {
        Ok(_) => {}
        Err(StoreError::Command { stderr, .. }) => {
            if let Err(e) = GitStore::git_in(workdir, ["rebase", "--abort"], &env) {
                debug!(error = %e, "no rebase in progress to abort");
            }
            return Err(StoreError::RebaseConflict {
                onto: onto.to_string(),
                message: stderr,
            });
        }
        Err(e) => return Err(e),
    }
    let head = GitStore::git_in(workdir, ["rev-parse", "HEAD"], &[])?;
    let head: GitOid = head.parse()?;
    debug!(%head, %onto, "replayed worktree commits");
    Ok(head)
}

#[instrument(skip(repo), fields(path = %path.display()))]
pub fn worktree_add(
    repo: &GitStore,
    path: &Path,
    new_branch: &str,
    base: GitOid,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let base = base.to_string();
    repo.git([
        OsStr::new("worktree"),
        OsStr::new("add"),
        OsStr::new("--quiet"),
        OsStr::new("-b"),
        OsStr::new(new_branch),
        path.as_os_str(),
        OsStr::new(&base),
    ])?;
    Ok(())
}

#[instrument(skip(repo), fields(path = %path.display()))]
pub fn worktree_remove(repo: &GitStore, path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        repo.git([
            OsStr::new("worktree"),
            OsStr::new("remove"),
            OsStr::new("--force"),
            path.as_os_str(),
        ])?;
    }
    repo.git(["worktree", "prune"])?;
    Ok(())
}

pub fn worktree_list(repo: &GitStore) -> Result<Vec<WorktreeInfo>, StoreError> {
    let raw = repo.git(["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_porcelain(&raw).into_iter().skip(1).collect())
}

/// Parse `git worktree list --porcelain`. The first record is the main
/// working tree.
pub(crate) fn parse_worktree_porcelain(raw: &str) -> Vec<WorktreeInfo> {
    let mut out = Vec::new();
    for record in raw.split("\n\n") {
        let mut info: Option<WorktreeInfo> = None;
        for line in record.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                info = Some(WorktreeInfo {
                    path: PathBuf::from(path),
                    head: None,
                    branch: None,
                });
            } else if let Some(wt) = info.as_mut() {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    wt.head = head.parse().ok();
                } else if let Some(branch) = line.strip_prefix("branch ") {
                    wt.branch = Some(branch.to_owned());
                }
            }
        }
        out.extend(info);
    }
    out
}

pub fn delete_branch(repo: &GitStore, branch: &str) -> Result<(), StoreError> {
    let full = format!("refs/heads/{branch}");
    let exists = repo
        .git(["show-ref", "--verify", "--quiet", full.as_str()])
        .is_ok();
    if exists {
        repo.git(["branch", "-D", "--quiet", branch])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("a/../../b").is_err());
        assert!(safe_relative("").is_err());
        assert!(safe_relative("docs/readme.md").is_ok());
    }

    #[test]
    fn parses_porcelain_records() {
        let raw = "worktree /srv/main\nHEAD 0123456789abcdef0123456789abcdef01234567\nbranch refs/heads/main\n\n\
                   worktree /srv/ws/abc\nHEAD 89abcdef0123456789abcdef0123456789abcdef\nbranch refs/heads/treesync/alice/abc\n";
        let list = parse_worktree_porcelain(raw);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].path, PathBuf::from("/srv/ws/abc"));
        assert_eq!(list[1].branch.as_deref(), Some("refs/heads/treesync/alice/abc"));
        assert!(list[1].head.is_some());
    }

    #[test]
    fn parses_detached_worktree() {
        let raw = "worktree /a\nHEAD 0123456789abcdef0123456789abcdef01234567\ndetached\n";
        let list = parse_worktree_porcelain(raw);
        assert_eq!(list[0].branch, None);
    }
}
