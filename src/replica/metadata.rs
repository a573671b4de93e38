//! Persisted replica state: `<replica dir>.sync.json`.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use treesync_git::GitOid;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaMetadata {
    /// Last commit applied to the replica (its sync cursor).
    pub remote_head: Option<GitOid>,
    /// Set when the replica was built from a bulk snapshot rather than
    /// cloned, so its ids do not match upstream.
    #[serde(default)]
    pub synthetic: bool,
    pub updated_at: DateTime<Utc>,
}

impl ReplicaMetadata {
    #[must_use]
    pub fn now(remote_head: Option<GitOid>, synthetic: bool) -> Self {
        Self {
            remote_head,
            synthetic,
            updated_at: Utc::now(),
        }
    }

    /// Metadata file for the replica stored at `replica_dir`.
    #[must_use]
    pub fn path_for(replica_dir: &Path) -> PathBuf {
        let mut name = replica_dir.as_os_str().to_owned();
        name.push(".sync.json");
        PathBuf::from(name)
    }

    /// Read the metadata file. A missing or unreadable file is `None`: the
    /// replica is then revalidated from its store.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt replica metadata");
                None
            }
        }
    }

    /// Write to a temp file in the same directory, fsync it, rename it over
    /// `path` and fsync the directory. Readers never see a torn file and a
    /// crash leaves either the old or the new cursor.
    ///
    /// # Errors
    /// Returns I/O errors from creating, writing, syncing or renaming.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".sync-")
            .suffix(".tmp")
            .tempfile_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        #[cfg(unix)]
        {
            // Best effort: the rename is already visible.
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Remove the metadata file, ignoring a missing one.
    ///
    /// # Errors
    /// Returns other I/O errors.
    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
