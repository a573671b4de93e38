//! Consuming the relay.
//!
//! [`EventStreamClient`] follows a remote relay's `GET /events` stream and
//! reconnects with capped exponential backoff. [`EventSubscription::in_process`]
//! does the same against an [`EventRelay`] living in this process. Either way
//! the handler learns about every (re)connect so it can revalidate whatever
//! it may have missed while disconnected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EventRelay;
use crate::error::{Result, SyncError};
use crate::event::SyncEvent;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Receives events from a subscription.
///
/// Callbacks for one subscription never overlap: the next event is not
/// delivered until the previous callback has returned.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called after every successful connect. `reconnect` is `false` only
    /// the first time; on `true` the handler should assume it missed events.
    async fn on_connect(&self, reconnect: bool);

    async fn on_event(&self, event: SyncEvent);
}

// ---------------------------------------------------------------------------
// EventSubscription
// ---------------------------------------------------------------------------

/// A running subscription. Dropping it cancels the subscription; use
/// [`close`](Self::close) to also wait until no callback is running.
pub struct EventSubscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    fn spawn<F>(run: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(token.clone()));
        Self {
            token,
            task: Some(task),
        }
    }

    /// Subscribe `handler` to an in-process relay.
    ///
    /// A subscriber dropped for lagging is replaced by a fresh one and the
    /// handler is told it reconnected.
    #[must_use]
    pub fn in_process(relay: EventRelay, handler: Arc<dyn EventHandler>) -> Self {
        Self::spawn(move |token| async move {
            let mut reconnect = false;
            loop {
                let mut sub = relay.subscribe();
                handler.on_connect(reconnect).await;
                reconnect = true;
                loop {
                    let next = tokio::select! {
                        () = token.cancelled() => return,
                        next = sub.recv() => next,
                    };
                    match next {
                        Some(event) => handler.on_event(event).await,
                        None => break,
                    }
                }
                debug!("in-process subscriber dropped; resubscribing");
            }
        })
    }

    /// Stop the subscription. Once this returns the handler receives no
    /// further callbacks.
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            warn!(error = %e, "event subscription task panicked");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// EventStreamClient
// ---------------------------------------------------------------------------

/// Client for a remote relay's NDJSON event stream.
#[derive(Clone)]
pub struct EventStreamClient {
    http: reqwest::Client,
    url: String,
    max_backoff: Duration,
}

impl EventStreamClient {
    /// `base_url` is the relay root, e.g. `http://127.0.0.1:7410`.
    ///
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, max_backoff: Duration) -> Result<Self> {
        // No request timeout: the stream is expected to stay open.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Upstream {
                url: base_url.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            http,
            url: format!("{}/events", base_url.trim_end_matches('/')),
            max_backoff: max_backoff.max(INITIAL_BACKOFF),
        })
    }

    /// Start following the stream, delivering events to `handler` until the
    /// returned subscription is closed or dropped.
    #[must_use]
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> EventSubscription {
        let client = self.clone();
        EventSubscription::spawn(move |token| async move {
            client.run(handler.as_ref(), &token).await;
        })
    }

    async fn run(&self, handler: &dyn EventHandler, token: &CancellationToken) {
        let mut connected_before = false;
        let mut attempt: u32 = 0;
        while !token.is_cancelled() {
            let mut connected = false;
            match self.follow(handler, token, connected_before, &mut connected).await {
                Ok(()) => debug!(url = %self.url, "event stream ended"),
                Err(detail) => warn!(url = %self.url, %detail, "event stream failed"),
            }
            if connected {
                connected_before = true;
                attempt = 0;
            }
            let delay = backoff(attempt, self.max_backoff);
            attempt = attempt.saturating_add(1);
            debug!(?delay, "reconnecting to event stream");
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection: read lines until the stream ends, fails, or the
    /// token is cancelled. A callback that has started always finishes.
    async fn follow(
        &self,
        handler: &dyn EventHandler,
        token: &CancellationToken,
        reconnect: bool,
        connected: &mut bool,
    ) -> std::result::Result<(), String> {
        let response = tokio::select! {
            () = token.cancelled() => return Ok(()),
            r = self.http.get(&self.url).send() => r.map_err(|e| e.to_string())?,
        };
        let response = response.error_for_status().map_err(|e| e.to_string())?;

        *connected = true;
        info!(url = %self.url, reconnect, "connected to event stream");
        handler.on_connect(reconnect).await;

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                () = token.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            buffer.extend_from_slice(&chunk.map_err(|e| e.to_string())?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if line.trim().is_empty() {
                    continue;
                }
                match SyncEvent::from_line(&line) {
                    Ok(event) => handler.on_event(event).await,
                    Err(e) => warn!(error = %e, "skipping malformed event line"),
                }
            }
        }
    }
}

fn backoff(attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(max)
}
