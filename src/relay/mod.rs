//! Event relay: best-effort fan-out of [`SyncEvent`]s.
//!
//! The relay holds no history. A subscriber sees only events published
//! while it is connected, in publish order; one that falls more than
//! `capacity` events behind is dropped rather than slowed down. Gaps are
//! closed on the replica side by revalidating on (re)connect.
//!
//! - [`EventRelay`]: the in-process broadcast hub.
//! - [`server`]: the axum surface (`GET /events`, `POST /events`, `GET /health`).
//! - [`client`]: [`EventStreamClient`] and [`EventSubscription`] for consumers.
//! - [`EventPublisher`]: how writers publish, locally or over HTTP.

pub mod client;
pub mod server;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::event::SyncEvent;

pub use client::{EventHandler, EventStreamClient, EventSubscription};

// ---------------------------------------------------------------------------
// EventRelay
// ---------------------------------------------------------------------------

/// In-process broadcast hub. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventRelay {
    tx: broadcast::Sender<SyncEvent>,
    published: Arc<AtomicU64>,
}

impl EventRelay {
    /// `capacity` is the per-subscriber buffer before it counts as lagging.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Broadcast `event` to everyone currently subscribed.
    ///
    /// Returns the number of subscribers the event was queued for. Zero is
    /// not an error: nobody was listening.
    pub fn publish(&self, event: SyncEvent) -> usize {
        self.send(event)
    }

    fn send(&self, event: SyncEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(n) => {
                debug!(?kind, subscribers = n, "event published");
                n
            }
            Err(_) => {
                debug!(?kind, "event published with no subscribers");
                0
            }
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> RelaySubscriber {
        RelaySubscriber {
            rx: self.tx.subscribe(),
            dropped: false,
        }
    }

    /// Live subscriber count.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events published since start.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn health(&self) -> RelayHealth {
        RelayHealth {
            connections: self.connections(),
            published: self.published(),
        }
    }
}

/// Body of `GET /health`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHealth {
    pub connections: usize,
    pub published: u64,
}

// ---------------------------------------------------------------------------
// RelaySubscriber
// ---------------------------------------------------------------------------

/// One subscription to an [`EventRelay`].
pub struct RelaySubscriber {
    rx: broadcast::Receiver<SyncEvent>,
    dropped: bool,
}

impl RelaySubscriber {
    /// Next event, or `None` once the subscriber has been dropped for
    /// lagging or the relay is gone. A dropped subscriber stays dropped;
    /// subscribe again to resume.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        if self.dropped {
            return None;
        }
        match self.rx.recv().await {
            Ok(ev) => Some(ev),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "subscriber lagged; dropping it");
                self.dropped = true;
                None
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.dropped = true;
                None
            }
        }
    }

    pub(crate) fn into_receiver(self) -> broadcast::Receiver<SyncEvent> {
        self.rx
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Where a writer sends its events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event, returning how many subscribers received it.
    async fn publish(&self, event: SyncEvent) -> Result<usize>;
}

#[async_trait]
impl EventPublisher for EventRelay {
    async fn publish(&self, event: SyncEvent) -> Result<usize> {
        Ok(self.send(event))
    }
}

/// Publishes to a relay running in another process via `POST /events`.
#[derive(Clone)]
pub struct HttpPublisher {
    http: reqwest::Client,
    url: String,
}

/// Body returned by `POST /events`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub delivered: usize,
}

impl HttpPublisher {
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Upstream {
                url: base_url.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            http,
            url: format!("{}/events", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EventPublisher for HttpPublisher {
    async fn publish(&self, event: SyncEvent) -> Result<usize> {
        let upstream = |e: reqwest::Error| SyncError::Upstream {
            url: self.url.clone(),
            detail: e.to_string(),
        };
        let ack: PublishAck = self
            .http
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .map_err(upstream)?;
        Ok(ack.delivered)
    }
}
