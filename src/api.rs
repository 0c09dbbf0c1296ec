//! REST + WebSocket surface served by `run-dispatcher`.
//!
//! - `POST /api/sessions` dispatches explicit messages
//! - `POST /api/threads/{thread_id}/sessions` dispatches a chat thread's context
//! - `GET /api/sessions/{id}` polls a session and its trace
//! - `GET /ws/sessions/{id}` streams snapshots and events until terminal

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{Error, SessionError};
use crate::notify::{SessionUpdate, StatusNotifier};
use crate::session::{ChatMessage, Metadata};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub notifier: StatusNotifier,
}

/// Build the Axum router with session REST and WebSocket routes.
pub fn session_routes(dispatcher: Dispatcher, notifier: StatusNotifier) -> Router {
    let state = ApiState {
        dispatcher,
        notifier,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/threads/{thread_id}/sessions", post(create_thread_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/ws/sessions/{id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Session(SessionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        error_response(status, self.to_string())
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "session-orchestrator"
    }))
}

// ── REST ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    metadata: Metadata,
}

async fn create_session(
    State(state): State<ApiState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, Error> {
    let session = state.dispatcher.dispatch(body.messages, body.metadata).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn create_thread_session(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Response {
    let thread_id = match parse_id(&thread_id, "thread") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.dispatcher.dispatch_thread(thread_id, Metadata::new()).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "session") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.notifier.poll(id).await {
        Ok(trace) => (StatusCode::OK, Json(trace)).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id, "session") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    // Reject unknown sessions before upgrading.
    if let Err(e) = state.notifier.poll(id).await {
        return e.into_response();
    }

    info!(session_id = %id, "Session WebSocket client connecting");
    let updates = state.notifier.subscribe(id);
    ws.on_upgrade(move |socket| handle_socket(socket, id, updates))
}

async fn handle_socket(
    mut socket: WebSocket,
    session_id: Uuid,
    mut updates: BoxStream<'static, SessionUpdate>,
) {
    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(update) => {
                    let json = match serde_json::to_string(&update) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Failed to serialize update");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        debug!(session_id = %session_id, "Client disconnected during send");
                        break;
                    }
                }
                None => {
                    debug!(session_id = %session_id, "Session reached a terminal state, closing");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },

            msg = socket.recv() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = %session_id, "Session WebSocket client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "Session WebSocket error");
                    break;
                }
                _ => {}
            },
        }
    }
}
