//! Fetch, ls-remote and push via the git CLI.
//!
//! gix does not provide push, and its shallow-fetch support is newer than
//! the CLI's, so all network operations go through `git`.

use std::path::Path;

use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::git_store::GitStore;
use crate::store::ObjectStore as _;
use crate::types::{FetchDepth, GitOid};

#[instrument(skip(repo), fields(root = %repo.root().display()))]
pub fn fetch(
    repo: &GitStore,
    remote: &str,
    branch: &str,
    depth: FetchDepth,
) -> Result<(), StoreError> {
    let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
    let mut args: Vec<String> = vec![
        "fetch".into(),
        "--quiet".into(),
        "--no-tags".into(),
        "--no-write-fetch-head".into(),
    ];
    if let FetchDepth::Deepen(n) = depth {
        if repo.is_shallow()? {
            args.push(format!("--deepen={}", n.max(1)));
        } else {
            debug!("history already complete; deepen is a plain fetch");
        }
    }
    args.push(remote.to_owned());
    args.push(refspec);
    repo.git(&args)?;
    Ok(())
}

pub fn remote_head(
    repo: &GitStore,
    remote: &str,
    branch: &str,
) -> Result<Option<GitOid>, StoreError> {
    let full = format!("refs/heads/{branch}");
    let out = repo.git(["ls-remote", "--heads", remote, full.as_str()])?;
    for line in out.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(oid), Some(name)) = (fields.next(), fields.next())
            && name == full
        {
            return Ok(Some(oid.parse()?));
        }
    }
    Ok(None)
}

#[instrument(skip(env), fields(workdir = %workdir.display(), env_keys = env.len()))]
pub fn push(
    workdir: &Path,
    remote: &str,
    refspec: &str,
    env: &[(String, String)],
) -> Result<(), StoreError> {
    match GitStore::git_in(workdir, ["push", remote, refspec], env) {
        Ok(_) => Ok(()),
        Err(StoreError::Command { stderr, .. })
            if stderr.contains("(fetch first)") || stderr.contains("(non-fast-forward)") =>
        {
            Err(StoreError::StaleTip {
                remote: remote.to_owned(),
                message: stderr,
            })
        }
        Err(StoreError::Command { stderr, .. })
            if stderr.contains("rejected")
                || stderr.contains("failed to push")
                || stderr.contains("Authentication failed")
                || stderr.contains("could not read Username") =>
        {
            Err(StoreError::PushRejected {
                remote: remote.to_owned(),
                message: stderr,
            })
        }
        Err(e) => Err(e),
    }
}

pub fn set_remote(repo: &GitStore, name: &str, url: &str) -> Result<(), StoreError> {
    let existing = repo.git(["remote"])?;
    if existing.lines().any(|r| r == name) {
        repo.git(["remote", "set-url", name, url])?;
    } else {
        repo.git(["remote", "add", name, url])?;
    }
    Ok(())
}
