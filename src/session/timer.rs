//! Debounced one-shot task.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs an action once `delay` has passed without another
/// [`schedule`](Self::schedule) call.
///
/// Cancelling only stops a pending wait: once the action has started it
/// runs to completion.
pub struct DebouncedTask {
    delay: Duration,
    pending: Mutex<Option<Pending>>,
}

struct Pending {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl DebouncedTask {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// (Re)start the countdown for `action`, replacing any pending one.
    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let wait = token.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = wait.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            action().await;
        });
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Pending { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    pub fn cancel(&self) {
        if let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.token.cancel();
        }
    }

    /// `true` while a countdown is running or its action has not finished.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.token.is_cancelled() && !p.handle.is_finished())
    }
}

impl Drop for DebouncedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
