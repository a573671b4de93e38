//! Commit metadata and changed-path sets via `git show` / `git diff-tree`.
//!
//! Commits on the shallow boundary are never described: git reports them
//! as parentless and diffs them against the empty tree, which would be a
//! wrong answer rather than a missing one.

use std::collections::HashSet;

use crate::error::StoreError;
use crate::git_store::GitStore;
use crate::store::ObjectStore;
use crate::types::{ChangeKind, ChangedPath, CommitInfo, GitOid};

const SHOW_FORMAT: &str = "--format=%H%x00%T%x00%P%x00%an <%ae>%x00%at%x00%B";

/// Commits whose parents the local store does not have (`$GIT_DIR/shallow`).
/// Empty for a complete history.
pub fn shallow_boundary(repo: &GitStore) -> Result<HashSet<GitOid>, StoreError> {
    let path = repo.root().join(repo.git(["rev-parse", "--git-path", "shallow"])?);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Ok(l.parse::<GitOid>()?))
        .collect()
}

pub fn read_commit(repo: &GitStore, oid: GitOid) -> Result<CommitInfo, StoreError> {
    if !crate::objects_impl::has_object(repo, oid)? {
        return Err(StoreError::MissingObject { oid });
    }
    if shallow_boundary(repo)?.contains(&oid) {
        return Err(StoreError::ShallowBoundary { oid });
    }
    describe(repo, oid)
}

fn describe(repo: &GitStore, oid: GitOid) -> Result<CommitInfo, StoreError> {
    let hex = oid.to_string();
    let raw = repo.git(["show", "-s", SHOW_FORMAT, hex.as_str()])?;
    let mut fields = raw.splitn(6, '\0');
    let mut next = |what: &str| {
        fields.next().ok_or_else(|| StoreError::Backend {
            message: format!("commit {oid}: missing {what} in `git show` output"),
        })
    };
    let id: GitOid = next("id")?.trim().parse()?;
    let tree: GitOid = next("tree")?.parse()?;
    let parents = next("parents")?
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<Vec<GitOid>, _>>()?;
    let author = next("author")?.to_owned();
    let timestamp = next("timestamp")?
        .parse::<i64>()
        .map_err(|e| StoreError::Backend {
            message: format!("commit {oid}: bad timestamp: {e}"),
        })?;
    let message = next("message")?.trim_end().to_owned();

    Ok(CommitInfo {
        oid: id,
        tree,
        parents,
        message,
        author,
        timestamp,
        changes: changed_paths(repo, oid)?,
    })
}

/// Paths changed by `oid` relative to its first parent (root commits list
/// every path as added).
fn changed_paths(repo: &GitStore, oid: GitOid) -> Result<Vec<ChangedPath>, StoreError> {
    let hex = oid.to_string();
    let raw = repo.git([
        "diff-tree",
        "--no-commit-id",
        "--root",
        "-r",
        "-z",
        "-M",
        "--name-status",
        hex.as_str(),
    ])?;
    Ok(parse_name_status(&raw))
}

/// Parse `--name-status -z` output: status, NUL, path (NUL, path for
/// renames and copies).
pub(crate) fn parse_name_status(raw: &str) -> Vec<ChangedPath> {
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());
    let mut out = Vec::new();
    while let Some(status) = tokens.next() {
        let Some(first) = tokens.next() else { break };
        let change = match status.chars().next() {
            Some('A') => ChangedPath::new(first, ChangeKind::Added),
            Some('D') => ChangedPath::new(first, ChangeKind::Deleted),
            Some('R') => {
                let Some(second) = tokens.next() else { break };
                ChangedPath {
                    path: second.to_owned(),
                    kind: ChangeKind::Renamed,
                    previous_path: Some(first.to_owned()),
                }
            }
            Some('C') => {
                let Some(second) = tokens.next() else { break };
                ChangedPath::new(second, ChangeKind::Added)
            }
            _ => ChangedPath::new(first, ChangeKind::Modified),
        };
        out.push(change);
    }
    out
}

pub fn log(repo: &GitStore, rev: &str, limit: usize) -> Result<Vec<CommitInfo>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let boundary = shallow_boundary(repo)?;
    let n = limit.to_string();
    let raw = repo.git(["log", "--format=%H", "-n", n.as_str(), rev, "--"])?;
    let mut out = Vec::new();
    for line in raw.lines().filter(|l| !l.is_empty()) {
        let oid: GitOid = line.parse()?;
        if !boundary.contains(&oid) {
            out.push(describe(repo, oid)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_name_status() {
        let raw = "M\0src/lib.rs\0A\0new.txt\0D\0gone.txt\0R100\0old.md\0new.md\0";
        let changes = parse_name_status(raw);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[1].path, "new.txt");
        assert_eq!(changes[2].kind, ChangeKind::Deleted);
        assert_eq!(changes[3].path, "new.md");
        assert_eq!(changes[3].previous_path.as_deref(), Some("old.md"));
    }

    #[test]
    fn type_change_counts_as_modified() {
        let changes = parse_name_status("T\0link\0");
        assert_eq!(changes, vec![ChangedPath::new("link", ChangeKind::Modified)]);
    }

    #[test]
    fn truncated_output_is_ignored() {
        assert!(parse_name_status("R090\0only-one").is_empty());
        assert!(parse_name_status("").is_empty());
    }
}
