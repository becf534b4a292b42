//! # HTTP transport
//!
//! An axum router over [`ChatService`].
//!
//! | Method | Path                               | Operation                 |
//! |--------|------------------------------------|---------------------------|
//! | POST   | `/chats`                           | create chat               |
//! | GET    | `/chats/{chat_id}`                 | chat with messages        |
//! | POST   | `/chats/{chat_id}/messages`        | whole reply (JSON)        |
//! | POST   | `/chats/{chat_id}/messages/stream` | streamed reply (SSE)      |
//! | POST   | `/chats/{chat_id}/branch`          | branch chat               |
//! | GET    | `/models`                          | model catalog             |
//!
//! The caller is identified by the `x-user-id` header. Errors are returned
//! as `{"message": ...}` with the status from [`RelayError::status_code`];
//! infrastructure details are logged, never returned.
//!
//! SSE frames carry the frame type as the event name and a JSON payload.

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{convert::Infallible, future::Future, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    bridge::stream_reply,
    error::{RelayError, Result},
    models::{AiModel, Chat, Message},
    service::{BranchChat, ChatService, SendMessage},
    store::ChatWithMessages,
};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    service: Arc<ChatService>,
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub i32);

impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing caller identity."))?;
        raw.trim()
            .parse::<i32>()
            .map(CallerId)
            .map_err(|_| ApiError::unauthorized("Invalid caller identity."))
    }
}

/// Error body returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.caller_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct CreateChat {
    title: Option<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(body): Json<CreateChat>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let chat = state.service.create_chat(user_id, body.title).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(chat_id): Path<i32>,
) -> ApiResult<Json<ChatWithMessages>> {
    Ok(Json(state.service.get_chat(user_id, chat_id).await?))
}

async fn send_message(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(chat_id): Path<i32>,
    Json(body): Json<SendMessage>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.service.send_message(user_id, chat_id, body).await?))
}

async fn stream_message(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(chat_id): Path<i32>,
    Json(body): Json<SendMessage>,
) -> impl IntoResponse {
    let frames = stream_reply(state.service.clone(), user_id, chat_id, body).map(|frame| {
        Ok::<_, Infallible>(Event::default()
            .event(frame.event_name())
            .data(frame.data().to_string()))
    });
    Sse::new(frames).keep_alive(KeepAlive::default())
}

async fn branch_chat(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(chat_id): Path<i32>,
    Json(body): Json<BranchChat>,
) -> ApiResult<(StatusCode, Json<ChatWithMessages>)> {
    let branch = state.service.branch_chat(user_id, chat_id, body).await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Vec<AiModel>>> {
    Ok(Json(state.service.list_models().await?))
}

/// Build the router.
pub fn router(service: Arc<ChatService>) -> Router {
    Router::new()
        .route("/chats", post(create_chat))
        .route("/chats/{chat_id}", get(get_chat))
        .route("/chats/{chat_id}/messages", post(send_message))
        .route("/chats/{chat_id}/messages/stream", post(stream_message))
        .route("/chats/{chat_id}/branch", post(branch_chat))
        .route("/models", get(list_models))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_listener<F>(listener: TcpListener, service: Arc<ChatService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RelayError::Config(format!("HTTP server failed: {e}")))
}

/// Bind `listen_addr` and serve until Ctrl-C.
pub async fn serve(listen_addr: &str, service: Arc<ChatService>) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| RelayError::Config(format!("cannot bind {listen_addr}: {e}")))?;
    info!(addr = listen_addr, "HTTP server listening");

    serve_with_listener(listener, service, shutdown_signal()).await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
