//! HTTP surface of the write-session manager.
//!
//! | Route                          | Body                        |
//! |--------------------------------|-----------------------------|
//! | `POST /sessions`               | `{"principal", "repo"}`     |
//! | `GET /sessions`                |                             |
//! | `GET /sessions/{id}`           |                             |
//! | `POST /sessions/{id}/stage`    | `{"path", "content"?}`      |
//! | `POST /sessions/{id}/commit`   | `{"message"?}`              |
//! | `POST /sessions/{id}/push`     |                             |
//! | `DELETE /sessions/{id}`        |                             |
//! | `POST /write`                  | `{"principal", "repo", "path", "content"?}` |
//!
//! Successful writes answer with a [`WriteAck`]; failures with a
//! [`WriteFailure`] and a status derived from the error.

use std::future::Future;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use super::{SessionInfo, SessionManager, WriteAck, WriteFailure};
use crate::error::SyncError;
use crate::model::{PrincipalId, RepoSlug, SessionId};

/// Build the session router.
pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/sessions", post(open_session).get(list_sessions))
        .route("/sessions/{id}", get(session_info).delete(close_session))
        .route("/sessions/{id}/stage", post(stage))
        .route("/sessions/{id}/commit", post(commit))
        .route("/sessions/{id}/push", post(push))
        .route("/write", post(write))
        .with_state(manager)
}

/// Serve the session API on `listener` until `shutdown` resolves.
///
/// # Errors
/// Returns the I/O error that stopped the server.
pub async fn serve(
    manager: SessionManager,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "session api listening");
    }
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
}

/// A [`SyncError`] rendered as a [`WriteFailure`].
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(WriteFailure::from(&self.0))).into_response()
    }
}

/// HTTP status for an error.
#[must_use]
pub const fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::NotFound { .. } | SyncError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::SessionConflict { .. } | SyncError::ChainAborted { .. } => StatusCode::CONFLICT,
        SyncError::EmptyCommit { .. } | SyncError::InvalidPath { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SyncError::Invalid { .. } => StatusCode::BAD_REQUEST,
        SyncError::Push { .. } | SyncError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct OpenRequest {
    principal: String,
    repo: String,
}

#[derive(Deserialize)]
struct StageRequest {
    path: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CommitRequest {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct WriteRequest {
    principal: String,
    repo: String,
    path: String,
    #[serde(default)]
    content: Option<String>,
}

fn session_id(raw: &str) -> Result<SessionId, SyncError> {
    SessionId::new(raw).map_err(|_| SyncError::SessionNotFound {
        session: raw.to_owned(),
    })
}

async fn open_session(
    State(manager): State<SessionManager>,
    Json(req): Json<OpenRequest>,
) -> ApiResult<(StatusCode, Json<WriteAck>)> {
    let principal = PrincipalId::new(&req.principal).map_err(SyncError::from)?;
    let repo = RepoSlug::new(&req.repo).map_err(SyncError::from)?;
    let ack = manager.open(&principal, &repo).await?;
    Ok((StatusCode::CREATED, Json(ack)))
}

async fn list_sessions(State(manager): State<SessionManager>) -> Json<Vec<SessionInfo>> {
    Json(manager.list())
}

async fn session_info(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    Ok(Json(manager.info(&session_id(&id)?)?))
}

async fn stage(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Json(req): Json<StageRequest>,
) -> ApiResult<Json<WriteAck>> {
    let id = session_id(&id)?;
    Ok(Json(manager.stage(&id, &req.path, req.content).await?))
}

async fn commit(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Json(req): Json<CommitRequest>,
) -> ApiResult<Json<WriteAck>> {
    let id = session_id(&id)?;
    let message = req.message.unwrap_or_default();
    Ok(Json(manager.commit(&id, &message).await?))
}

async fn push(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> ApiResult<Json<WriteAck>> {
    Ok(Json(manager.push(&session_id(&id)?).await?))
}

async fn close_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> ApiResult<Json<WriteAck>> {
    Ok(Json(manager.close(&session_id(&id)?).await?))
}

async fn write(
    State(manager): State<SessionManager>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<Json<WriteAck>> {
    let principal = PrincipalId::new(&req.principal).map_err(SyncError::from)?;
    let repo = RepoSlug::new(&req.repo).map_err(SyncError::from)?;
    Ok(Json(
        manager
            .stage_as(&principal, &repo, &req.path, req.content)
            .await?,
    ))
}
