//! The set of replicas a process holds, keyed by slug.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{ApplyOutcome, Replica, ReplicaSettings};
use crate::config::TreesyncConfig;
use crate::error::{Result, SyncError};
use crate::model::RepoSlug;

/// Creates replicas on first lookup and hands out shared handles.
pub struct ReplicaRegistry {
    config: TreesyncConfig,
    replicas: Mutex<BTreeMap<RepoSlug, Arc<Replica>>>,
}

impl ReplicaRegistry {
    #[must_use]
    pub fn new(config: TreesyncConfig) -> Self {
        Self {
            config,
            replicas: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TreesyncConfig {
        &self.config
    }

    /// The replica for `slug`, created on first lookup. A copy left on disk
    /// by an earlier run is picked up as `Ready`.
    ///
    /// # Errors
    /// [`SyncError::NotFound`] if `slug` is not a configured repository.
    pub async fn get_or_create(&self, slug: &RepoSlug) -> Result<Arc<Replica>> {
        let mut replicas = self.replicas.lock().await;
        if let Some(replica) = replicas.get(slug) {
            return Ok(Arc::clone(replica));
        }
        let entry = self.config.repo(slug).ok_or_else(|| SyncError::NotFound {
            what: format!("repository '{slug}' in the configuration"),
        })?;
        let replica = Replica::open(ReplicaSettings::from_config(&self.config, entry)).await;
        info!(repo = %slug, state = ?replica.state(), "replica registered");
        replicas.insert(slug.clone(), Arc::clone(&replica));
        Ok(replica)
    }

    /// The replica for `slug` if one has been created.
    pub async fn get(&self, slug: &RepoSlug) -> Option<Arc<Replica>> {
        self.replicas.lock().await.get(slug).cloned()
    }

    /// Forget the replica for `slug` and delete its local copy. Returns
    /// `false` if there was none.
    ///
    /// # Errors
    /// I/O errors deleting the copy.
    #[instrument(skip(self), fields(repo = %slug))]
    pub async fn clear(&self, slug: &RepoSlug) -> Result<bool> {
        let removed = self.replicas.lock().await.remove(slug);
        match removed {
            Some(replica) => {
                replica.wipe().await?;
                info!("replica cleared");
                Ok(true)
            }
            None => {
                // A copy may still be on disk from an earlier run.
                if let Some(entry) = self.config.repo(slug) {
                    let settings = ReplicaSettings::from_config(&self.config, entry);
                    if settings.dir.exists() {
                        Replica::open(settings).await.wipe().await?;
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Registered replicas, ordered by slug.
    pub async fn list(&self) -> Vec<Arc<Replica>> {
        self.replicas.lock().await.values().cloned().collect()
    }

    /// Revalidate every registered replica concurrently.
    pub async fn revalidate_all(&self) -> Vec<(RepoSlug, Result<Option<ApplyOutcome>>)> {
        let replicas = self.list().await;
        let results = join_all(replicas.iter().map(|r| r.revalidate())).await;
        replicas
            .iter()
            .zip(results)
            .map(|(replica, result)| {
                if let Err(e) = &result {
                    warn!(repo = %replica.slug(), error = %e, "revalidation failed");
                }
                (replica.slug().clone(), result)
            })
            .collect()
    }
}
