//! HTTP surface: the four endpoint shapes of spec §6, built the way the
//! teacher builds its MCP HTTP transport (axum router, SSE via
//! `axum::response::sse`, permissive CORS, `TraceLayer`).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::session::Role;
use super::Relay;
use crate::protocol::{Message, RawMessage};

/// Wraps a peer's event stream so that the relay learns about a transport
/// close (spec §4.2 "Liveness") as soon as axum drops the stream, whether
/// that happens because the client disconnected or the request future was
/// cancelled.
struct DisconnectOnDrop<S> {
    inner: S,
    relay: Arc<Relay>,
    /// The peer's *current* session, shared with its `Peer` record so a
    /// `session/join` move is visible here even though this struct was built
    /// once at attach time (spec §4.2 "Liveness").
    current_session: Arc<Mutex<String>>,
    peer_id: String,
}

impl<S: Stream + Unpin> Stream for DisconnectOnDrop<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl<S> Drop for DisconnectOnDrop<S> {
    fn drop(&mut self) {
        let session_id = self.current_session.lock().unwrap().clone();
        self.relay.disconnect(&session_id, &self.peer_id);
    }
}

/// Build the relay's HTTP router.
pub fn create_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/events", get(handle_events))
        .route("/message", post(handle_message))
        .route("/health", get(handle_health))
        .route("/sessions", get(handle_sessions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

#[derive(Debug, Deserialize)]
struct AttachQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
    role: RoleParam,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RoleParam {
    Provider,
    Caller,
}

async fn handle_events(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<AttachQuery>,
) -> impl IntoResponse {
    let role = match query.role {
        RoleParam::Provider => Role::Provider,
        RoleParam::Caller => Role::Caller,
    };

    let attachment = relay.attach(&query.session_id, role);

    let mapped = UnboundedReceiverStream::new(attachment.receiver)
        .map(|event| Ok::<_, Infallible>(Event::default().event(event.event).data(event.data)));
    let stream = DisconnectOnDrop {
        inner: mapped,
        relay: Arc::clone(&relay),
        current_session: attachment.current_session,
        peer_id: attachment.peer_id,
    };

    (
        [("X-Accel-Buffering", "no"), ("Cache-Control", "no-cache, no-store, must-revalidate")],
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(relay.config().keep_alive)
                .text("keepalive"),
        ),
    )
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "peerId")]
    peer_id: Option<String>,
}

async fn handle_message(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<MessageQuery>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let raw: RawMessage = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
                .into_response();
        }
    };

    let message = match Message::classify(raw) {
        Ok(message) => message,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.message })))
                .into_response();
        }
    };

    relay.ingest(query.session_id, query.peer_id, message);
    Json(serde_json::json!({ "success": true })).into_response()
}

async fn handle_health(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": relay.session_count(),
        "peers": relay.peer_count(),
        "uptimeSeconds": relay.uptime_seconds(),
    }))
}

async fn handle_sessions(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": relay.sessions_snapshot() }))
}
