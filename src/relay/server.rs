//! HTTP surface of the relay.
//!
//! | Route          | Meaning                                              |
//! |----------------|------------------------------------------------------|
//! | `GET /events`  | NDJSON stream of events, live only, no backlog       |
//! | `POST /events` | publish one event; replies `{"delivered": n}`        |
//! | `GET /health`  | `{"connections": n, "published": n}`                |

use std::convert::Infallible;
use std::future::Future;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use super::{EventRelay, PublishAck};
use crate::event::SyncEvent;

pub const NDJSON: &str = "application/x-ndjson";

/// Build the relay router.
pub fn router(relay: EventRelay) -> Router {
    Router::new()
        .route("/events", get(stream_events).post(publish_event))
        .route("/health", get(health))
        .with_state(relay)
}

/// Serve the relay on `listener` until `shutdown` resolves.
///
/// # Errors
/// Returns the I/O error that stopped the server.
pub async fn serve(
    relay: EventRelay,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "relay listening");
    }
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn stream_events(State(relay): State<EventRelay>) -> Response {
    let rx = relay.subscribe().into_receiver();
    // The stream ends at the first lag; the client reconnects and
    // revalidates instead of receiving a gappy stream.
    let lines = BroadcastStream::new(rx)
        .map_while(|res| match res {
            Ok(event) => Some(event),
            Err(lagged) => {
                warn!(error = %lagged, "event stream subscriber lagged; closing");
                None
            }
        })
        .filter_map(|event| match event.to_line() {
            Ok(mut line) => {
                line.push('\n');
                Some(Ok::<_, Infallible>(line))
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                None
            }
        });
    (
        [(header::CONTENT_TYPE, NDJSON), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn publish_event(
    State(relay): State<EventRelay>,
    Json(event): Json<SyncEvent>,
) -> (StatusCode, Json<PublishAck>) {
    let delivered = relay.publish(event);
    (StatusCode::ACCEPTED, Json(PublishAck { delivered }))
}

async fn health(State(relay): State<EventRelay>) -> impl IntoResponse {
    Json(relay.health())
}
