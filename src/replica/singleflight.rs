//! Collapse identical concurrent operations into one in-flight future.
//!
//! The first caller for a key spawns the operation; callers arriving while it
//! runs await the same result. The operation runs on its own task, so it
//! finishes even if every caller goes away. A finished run is never joined:
//! the next caller starts a fresh one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt as _;
use futures_util::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;
use treesync_git::StoreError;

use crate::error::{Result, SyncError};

type SharedResult<T> = std::result::Result<T, Arc<SyncError>>;

struct Flight<T: Clone> {
    result: Shared<BoxFuture<'static, SharedResult<T>>>,
    task: AbortHandle,
}

impl<T: Clone> Flight<T> {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    inflight: Mutex<HashMap<K, Flight<T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    T: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    /// Run `op` under `key`, or join the run already in flight.
    ///
    /// # Errors
    /// Returns the operation's error. Callers that joined a run share it,
    /// so they receive an equivalent copy.
    pub async fn run<F, Fut>(&self, key: K, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let flight = {
            let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(flight) if flight.is_running() => flight.result.clone(),
                _ => {
                    let task = tokio::spawn(op());
                    let abort = task.abort_handle();
                    let result = async move {
                        match task.await {
                            Ok(result) => result.map_err(Arc::new),
                            Err(join) => Err(Arc::new(SyncError::from(join))),
                        }
                    }
                    .boxed()
                    .shared();
                    map.insert(
                        key.clone(),
                        Flight {
                            result: result.clone(),
                            task: abort,
                        },
                    );
                    result
                }
            }
        };

        let result = flight.await;

        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&key).is_some_and(|f| !f.is_running()) {
            map.remove(&key);
        }
        drop(map);

        result.map_err(unshare)
    }

    /// Number of keys with an operation in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|f| f.is_running())
            .count()
    }
}

/// Turn a shared error back into an owned one, copying it when other callers
/// still hold a reference.
fn unshare(err: Arc<SyncError>) -> SyncError {
    match Arc::try_unwrap(err) {
        Ok(owned) => owned,
        Err(shared) => copy_error(&shared),
    }
}

fn copy_error(err: &SyncError) -> SyncError {
    match err {
        SyncError::Bootstrap { repo, detail } => SyncError::Bootstrap {
            repo: repo.clone(),
            detail: detail.clone(),
        },
        SyncError::ApplyCommit { repo, oid, detail } => SyncError::ApplyCommit {
            repo: repo.clone(),
            oid: *oid,
            detail: detail.clone(),
        },
        SyncError::NotFound { what } => SyncError::NotFound { what: what.clone() },
        SyncError::Upstream { url, detail } => SyncError::Upstream {
            url: url.clone(),
            detail: detail.clone(),
        },
        SyncError::Store(StoreError::MissingObject { oid }) => {
            SyncError::Store(StoreError::MissingObject { oid: *oid })
        }
        SyncError::Store(StoreError::ShallowBoundary { oid }) => {
            SyncError::Store(StoreError::ShallowBoundary { oid: *oid })
        }
        SyncError::Store(StoreError::NotFound { message }) => {
            SyncError::Store(StoreError::NotFound {
                message: message.clone(),
            })
        }
        SyncError::Store(other) => SyncError::Store(StoreError::Backend {
            message: other.to_string(),
        }),
        SyncError::Io(io) => SyncError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => SyncError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn concurrent_identical_calls_run_once() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut callers = Vec::new();
        for _ in 0..5 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            callers.push(tokio::spawn(async move {
                flights
                    .run("fetch", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(7)
                    })
                    .await
            }));
        }
        // Let every caller join before the operation finishes.
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        for caller in callers {
            assert_eq!(caller.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collapse() {
        let flights: SingleFlight<u8, u8> = SingleFlight::default();
        let (a, b) = tokio::join!(
            flights.run(1, || async { Ok(1) }),
            flights.run(2, || async { Ok(2) }),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    }

    #[tokio::test]
    async fn completed_flight_is_not_reused() {
        let flights: SingleFlight<(), usize> = SingleFlight::default();
        let runs = Arc::new(AtomicUsize::new(0));
        for expected in 1..=3 {
            let runs = Arc::clone(&runs);
            let got = flights
                .run((), move || async move { Ok(runs.fetch_add(1, Ordering::SeqCst) + 1) })
                .await
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn run_abandoned_by_every_caller_is_not_replayed() {
        let flights: SingleFlight<(), usize> = SingleFlight::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), {
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            flights.run((), move || async move {
                release.notified().await;
                Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
            })
        })
        .await;
        assert!(abandoned.is_err());
        assert_eq!(flights.in_flight(), 1);

        // The spawned run still completes on its own.
        release.notify_one();
        while flights.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let runs_again = Arc::clone(&runs);
        let got = flights
            .run((), move || async move { Ok(runs_again.fetch_add(1, Ordering::SeqCst) + 1) })
            .await
            .unwrap();
        assert_eq!(got, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shared_errors_keep_their_variant() {
        let flights: Arc<SingleFlight<(), ()>> = Arc::default();
        let release = Arc::new(Notify::new());
        let slug = crate::model::RepoSlug::new("acme/docs").unwrap();

        let make = |release: Arc<Notify>, slug: crate::model::RepoSlug| {
            move || async move {
                release.notified().await;
                Err(SyncError::Bootstrap {
                    repo: slug,
                    detail: "clone failed".into(),
                })
            }
        };
        let f1 = Arc::clone(&flights);
        let first = tokio::spawn({
            let op = make(Arc::clone(&release), slug.clone());
            async move { f1.run((), op).await }
        });
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let f2 = Arc::clone(&flights);
        let second = tokio::spawn({
            let op = make(Arc::clone(&release), slug);
            async move { f2.run((), op).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        for handle in [first, second] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, SyncError::Bootstrap { .. }), "{err}");
        }
    }
}
