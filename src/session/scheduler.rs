//! Bounded execution of git processes and per-session sequencing.
//!
//! - [`ExecutionScheduler`]: at most `slots` native store operations run at
//!   once across every session. Waiters are admitted in arrival order.
//! - [`OpChain`]: one session's operations run strictly one after another.
//!   When an operation fails, the operations already queued behind it fail
//!   with [`SyncError::ChainAborted`] instead of running. Other chains are
//!   unaffected.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::SessionId;

// ---------------------------------------------------------------------------
// ExecutionScheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExecutionScheduler {
    slots: Arc<Semaphore>,
    capacity: usize,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// One occupied execution slot. Dropping it frees the slot.
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionScheduler {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let capacity = slots.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    ///
    /// # Errors
    /// Only if the scheduler has been shut down.
    pub async fn acquire(&self) -> Result<ExecutionSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Io(std::io::Error::other("execution scheduler closed")))?;
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(ExecutionSlot {
            _permit: permit,
            running: Arc::clone(&self.running),
        })
    }

    /// Run a blocking store operation in a slot.
    ///
    /// # Errors
    /// The operation's error.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot = self.acquire().await?;
        let result = tokio::task::spawn_blocking(op).await;
        drop(slot);
        result?
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations running right now.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of operations ever running at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// OpChain
// ---------------------------------------------------------------------------

pub struct OpChain {
    session: SessionId,
    turn: tokio::sync::Mutex<()>,
    failures: AtomicU64,
    last_cause: Mutex<String>,
}

impl OpChain {
    #[must_use]
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            turn: tokio::sync::Mutex::new(()),
            failures: AtomicU64::new(0),
            last_cause: Mutex::new(String::new()),
        }
    }

    /// Run `op` after every operation queued before it.
    ///
    /// # Errors
    /// [`SyncError::ChainAborted`] if an operation ahead of this one failed
    /// while it was waiting; otherwise the operation's own error.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seen = self.failures.load(Ordering::SeqCst);
        let _turn = self.turn.lock().await;
        if self.failures.load(Ordering::SeqCst) != seen {
            let cause = self
                .last_cause
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            debug!(session = %self.session, %cause, "dropping queued operation");
            return Err(SyncError::ChainAborted {
                session: self.session.clone(),
                cause,
            });
        }
        let result = op().await;
        if let Err(e) = &result {
            *self
                .last_cause
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = e.to_string();
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_slot_count() {
        let scheduler = ExecutionScheduler::new(2);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            tasks.push(tokio::spawn(async move {
                scheduler
                    .run_blocking(|| {
                        std::thread::sleep(Duration::from_millis(30));
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(scheduler.peak(), 2);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let scheduler = ExecutionScheduler::new(1);
        let held = scheduler.acquire().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for n in 0..5 {
            let scheduler = scheduler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _slot = scheduler.acquire().await.unwrap();
                tx.send(n).unwrap();
            });
            // Queue them in a known order.
            tokio::task::yield_now().await;
        }
        drop(held);

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let chain = Arc::new(OpChain::new(SessionId::random()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in 0..5 {
            let chain = Arc::clone(&chain);
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                chain
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        log.lock().unwrap().push(n);
                        Ok(())
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_purges_only_queued_operations_of_that_chain() {
        let chain = Arc::new(OpChain::new(SessionId::random()));
        let other = Arc::new(OpChain::new(SessionId::random()));
        let release = Arc::new(Notify::new());

        let failing = tokio::spawn({
            let chain = Arc::clone(&chain);
            let release = Arc::clone(&release);
            async move {
                chain
                    .run(|| async move {
                        release.notified().await;
                        Err::<(), _>(SyncError::NotFound { what: "x".into() })
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let chain = Arc::clone(&chain);
                tokio::spawn(async move { chain.run(|| async { Ok(()) }).await })
            })
            .collect();
        tokio::task::yield_now().await;

        release.notify_one();
        assert!(failing.await.unwrap().is_err());
        for task in queued {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, SyncError::ChainAborted { .. }), "{err}");
            assert!(err.to_string().contains("x not found"));
        }

        // Later operations run normally, and other chains never noticed.
        chain.run(|| async { Ok(()) }).await.unwrap();
        other.run(|| async { Ok(()) }).await.unwrap();
    }
}
